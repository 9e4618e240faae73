pub mod agent;
pub mod api_log;
pub mod command;
pub mod event;
pub mod inference;
pub mod metric;
pub mod objective;
pub mod persona;
pub mod project;
pub mod turn;
