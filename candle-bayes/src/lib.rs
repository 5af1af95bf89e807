pub mod candle_bayes_autoencoder;
pub mod candle_data_loader;
pub mod candle_gaussian_params;
pub mod candle_loss_functions;
pub mod candle_matrix_io;
pub mod candle_trainer;
pub mod error;

pub use candle_core;
pub use candle_nn;
