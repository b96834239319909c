use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("empty diff: nothing to analyze")]
    EmptyDiff,

    #[error(transparent)]
    Classifier(#[from] theme_classifier::ClassifierError),
}
