pub mod pose;
pub mod twist;
pub mod wrench;
