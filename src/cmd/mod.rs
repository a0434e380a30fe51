pub mod filter;
pub mod measure;
pub mod observe;
pub mod selftest;
