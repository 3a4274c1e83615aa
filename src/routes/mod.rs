pub mod auth;
pub mod balance;
pub mod chart2csv;
pub mod gateway;
pub mod keys;
pub mod masker;
pub mod patas;
pub mod payments;
pub mod pricing;
pub mod proxy;
pub mod webhooks;
