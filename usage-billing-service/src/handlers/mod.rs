pub mod catalog;
pub mod events;
pub mod health;
pub mod invoices;
