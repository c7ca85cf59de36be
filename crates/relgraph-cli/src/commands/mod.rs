pub mod list;
pub mod map;
pub mod show;
