#![allow(non_snake_case)]

use types::Float;
pub extern crate nalgebra as na;

pub mod config;
pub mod control;
pub mod driver;
pub mod error;
pub mod kinematics;
pub mod robot;
pub mod sim;
pub mod spatial;
pub mod telemetry;
pub mod types;
pub mod util;

pub const GRAVITY: Float = 9.81;

pub const PI: Float = std::f64::consts::PI;
