pub mod cache;
pub mod edit_history;
pub mod receipts;
pub mod summary;
