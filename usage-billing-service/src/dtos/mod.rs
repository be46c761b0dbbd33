pub mod catalog;
pub mod events;
pub mod invoices;

pub use catalog::*;
pub use events::*;
pub use invoices::*;
