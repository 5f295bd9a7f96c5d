//! Per-monitor shell surfaces driven by a unified view of the running
//! compositor (River or Hyprland).

pub mod bar;
pub mod config;
pub mod outputs;
pub mod reactive;
pub mod services;
pub mod toolkit;
