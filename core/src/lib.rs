pub mod error;
pub mod tensor;
pub mod model;
pub mod tape;
pub mod traced;
pub mod gate;
pub mod cell;
pub mod dense;
pub mod pool;
pub mod sequence;
pub mod reverse;
pub mod sensitivity;
pub mod loss;
pub mod gradient;

pub use cell::{BoundCell, Cell, CellStack};
pub use dense::{DenseLayer, TraceRunner};
pub use error::HebbError;
pub use model::{DenseConfig, DenseParams, DenseTensor, RateMode};
pub use pool::{StartState, StateKey};
pub use reverse::{Gradients, Seed, StartGradient, Upstream};
pub use sequence::SequenceGraph;
