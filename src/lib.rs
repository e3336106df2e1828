pub mod nes;
pub mod scene;
