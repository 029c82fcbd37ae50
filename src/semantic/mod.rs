pub mod fragment;
pub mod transition;
