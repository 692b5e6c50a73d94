pub mod flash_credentials;
pub mod sd_fs;
