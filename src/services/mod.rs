pub mod fileserver;
pub mod form;
pub mod image;
pub mod lab;
pub mod prepuller;
