pub mod beam;
pub mod containment;
pub mod convergence;
pub mod correction;
pub mod geom;
pub mod instrument;
pub mod interpolation;
pub mod material;
pub mod output;
pub mod quadrature;
pub mod result;
pub mod settings;
pub mod sparse;
pub mod statistics;
pub mod strategy;
pub mod structure_factor;
pub mod track;
pub mod transport;
pub mod volume;
