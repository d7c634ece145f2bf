pub mod health;
pub mod instances;
