pub mod controller;
pub mod merkle;
pub mod planner;
pub mod routing;
pub mod tokens;
pub mod types;
pub mod uniswap;
