//! Handlers behind the `invoice-tally` subcommands. Each returns plain data;
//! printing is left to the binary.

pub mod invoices;
pub mod settings;
