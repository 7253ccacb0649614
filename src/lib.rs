pub mod antenna;
pub mod environment;
pub mod fresnel;
pub mod geom;
pub mod loss;
pub mod output;
pub mod powers;
pub mod result;
pub mod scan;
pub mod settings;
pub mod trace;
pub mod tree;
