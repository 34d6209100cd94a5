//! Text generation and translation through `mlx_lm.generate`.

pub mod generate;
pub mod session;
pub mod translate;

pub use generate::{GenerationRequest, Generator, MlxGenerator, ModelLocation};
pub use session::SessionCommand;
pub use translate::{Language, Translator};
