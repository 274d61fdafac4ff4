pub mod crypto;
pub mod normalizer;
pub mod openai;
pub mod processor;
pub mod state;
pub mod text_extraction;
pub mod voucher;
pub mod watcher;
