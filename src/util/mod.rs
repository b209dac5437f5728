pub mod buf_ext;
pub mod hex_dump;
