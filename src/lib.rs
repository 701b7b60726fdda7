//! Polynomial Texture Map decoding and relighting.
//!
//! [`ptm::decode`] turns file bytes into coefficient planes,
//! [`renderer::PtmRenderer`] packs them into GPU textures and draws them
//! under a movable light, and [`shading`] holds the same math as pure
//! functions for host-side checks and CPU rendering.

pub mod loader;
pub mod ptm;
pub mod renderer;
pub mod settings;
pub mod shading;
