pub mod catalog;
pub mod price;
pub mod report;
