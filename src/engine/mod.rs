pub mod command;
pub mod config;
pub mod game;
pub mod grid;
pub mod mapgen;
pub mod movement;
pub mod pac;
pub mod pathfinder;
pub mod ruleset;
pub mod server;
