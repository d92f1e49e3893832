use std::borrow::Cow;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadType {
    name: Cow<'static, str>,
    revision: Option<Cow<'static, str>>,
}

impl PayloadType {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            revision: None,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<Cow<'static, str>>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }
}

pub trait Payload {
    const TYPE_NAMES: &'static [&'static str];

    fn payload_type(&self) -> PayloadType;
}

pub trait Saga {
    const KIND: &'static str;
}
