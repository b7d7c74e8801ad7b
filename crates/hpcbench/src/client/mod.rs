pub mod commands;
pub mod globalsettings;
pub mod output;
pub mod recipe;
