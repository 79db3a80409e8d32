pub mod cae;
