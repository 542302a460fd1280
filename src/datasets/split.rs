use std::{fmt, str::FromStr};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetSplit {
    Train,
    Test,
}

impl DatasetSplit {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetSplit::Train => "train",
            DatasetSplit::Test => "test",
        }
    }
}

impl fmt::Display for DatasetSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unsupported dataset type {0:?}, only \"train\" and \"test\" are supported")]
pub struct SplitNotFoundError(pub String);

impl FromStr for DatasetSplit {
    type Err = SplitNotFoundError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(DatasetSplit::Train),
            "test" => Ok(DatasetSplit::Test),
            other => Err(SplitNotFoundError(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_splits() {
        assert_eq!("train".parse::<DatasetSplit>().unwrap(), DatasetSplit::Train);
        assert_eq!("test".parse::<DatasetSplit>().unwrap(), DatasetSplit::Test);
    }

    #[test]
    fn rejects_validation_split() {
        let err = "valid".parse::<DatasetSplit>().unwrap_err();
        assert_eq!(err.0, "valid");
    }
}
