pub mod hash;
pub mod notice;
pub mod path;
