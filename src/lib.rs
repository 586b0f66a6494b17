//! Frame-paced Vulkan presenter.
//!
//! `backend` wraps the Vulkan objects behind the `GpuDevice` seam, `graphics`
//! builds the per-surface frame bundle, `renderer` drives acquire, submit and
//! present with bounded frames in flight, and `app` connects it to a window.

pub mod app;
pub mod backend;
pub mod config;
pub mod graphics;
pub mod renderer;
