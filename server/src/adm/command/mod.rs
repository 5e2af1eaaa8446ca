pub mod generate_key;
pub mod test_chunking;
