pub mod sincedb;
