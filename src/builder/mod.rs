pub mod fileserver;
pub mod lab;
pub mod prepuller;
pub mod volumes;
