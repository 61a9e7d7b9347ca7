pub mod report;
pub mod run;

pub use report::*;
pub use run::*;
