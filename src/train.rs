mod early_stopping;
pub use early_stopping::EarlyStopping;

mod loss;
pub use loss::{weighted_cross_entropy, ClassWeighting};

mod scheduler;
pub use scheduler::{PlateauParams, ReduceOnPlateau};

mod trainer;
pub use trainer::{accuracy, clip_grad_norm, Checkpoint, Trainer, TrainerConfig, TrainingSummary};
