pub mod runner;
pub mod stages;
pub mod variant_discovery;
