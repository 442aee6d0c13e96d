pub mod capture;
pub mod correlation;
pub mod primary;
