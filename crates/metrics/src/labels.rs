use std::borrow::Cow;

/// Label set for metrics that report one success/error status dimension.
pub const STATUS_LABEL: [&str; 1] = ["status"];

/// A `(key, value)` metric label where the key is known at compile time.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct StaticMetricLabel {
    key: &'static str,
    value: Cow<'static, str>,
}

impl StaticMetricLabel {
    pub fn new(key: &'static str, value: impl Into<Cow<'static, str>>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }

    pub const STATUS_SUCCESS: StaticMetricLabel = StaticMetricLabel {
        key: "status",
        value: Cow::Borrowed("success"),
    };
    pub const STATUS_ERROR: StaticMetricLabel = StaticMetricLabel {
        key: "status",
        value: Cow::Borrowed("error"),
    };

    pub fn status(is_ok: bool) -> Self {
        if is_ok {
            Self::STATUS_SUCCESS
        } else {
            Self::STATUS_ERROR
        }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

pub trait IntoLabel {
    fn as_label(&self) -> &'static str;
}

impl IntoLabel for bool {
    fn as_label(&self) -> &'static str {
        if *self {
            "true"
        } else {
            "false"
        }
    }
}
