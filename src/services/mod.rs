pub mod copier;
pub mod credentials;
pub mod drive;
pub mod tasks;
