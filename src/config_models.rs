pub mod address_book_settings;
pub mod network_config;
