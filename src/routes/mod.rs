pub(crate) mod cache;
pub(crate) mod health;
pub(crate) mod reports;
