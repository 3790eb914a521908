use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

use crate::error::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    /// After identity and provenance checks, before the archive is fetched.
    PrePull,
    /// After the tag has been registered.
    PostPull,
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPoint::PrePull => write!(f, "pre-pull"),
            HookPoint::PostPull => write!(f, "post-pull"),
        }
    }
}

/// What a hook sees about the pull in progress.
#[derive(Debug, Clone)]
pub struct HookContext<'a> {
    pub collection: &'a str,
    pub asset: &'a str,
    pub tag: &'a str,
    /// Final artifact directory; `None` before the pull has produced one.
    pub path: Option<&'a Utf8Path>,
}

pub trait PullHook: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, point: HookPoint, context: &HookContext<'_>) -> Result<(), String>;
}

/// Any closure with the right shape is a hook.
pub struct FnHook<F> {
    name: String,
    func: F,
}

impl<F> FnHook<F>
where
    F: Fn(HookPoint, &HookContext<'_>) -> Result<(), String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> PullHook for FnHook<F>
where
    F: Fn(HookPoint, &HookContext<'_>) -> Result<(), String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, point: HookPoint, context: &HookContext<'_>) -> Result<(), String> {
        (self.func)(point, context)
    }
}

/// Registered hooks per lifecycle point.
#[derive(Default)]
pub struct Hooks {
    pre_pull: Vec<Box<dyn PullHook>>,
    post_pull: Vec<Box<dyn PullHook>>,
    /// Turn hook failures into pull failures instead of warnings.
    pub strict: bool,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, point: HookPoint, hook: Box<dyn PullHook>) {
        match point {
            HookPoint::PrePull => self.pre_pull.push(hook),
            HookPoint::PostPull => self.post_pull.push(hook),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pre_pull.is_empty() && self.post_pull.is_empty()
    }

    /// Run every hook for `point` in registration order. Failures are
    /// returned as warnings, or as the first error when `strict`.
    pub fn run(
        &self,
        point: HookPoint,
        context: &HookContext<'_>,
    ) -> Result<Vec<String>, RegistryError> {
        let hooks = match point {
            HookPoint::PrePull => &self.pre_pull,
            HookPoint::PostPull => &self.post_pull,
        };
        let mut warnings = Vec::new();
        for hook in hooks {
            if let Err(message) = hook.run(point, context) {
                if self.strict {
                    return Err(RegistryError::Hook {
                        hook: hook.name().to_string(),
                        message,
                    });
                }
                warn!(hook = hook.name(), %point, %message, "hook failed");
                warnings.push(format!("{point} hook '{}' failed: {message}", hook.name()));
            }
        }
        Ok(warnings)
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |hooks: &[Box<dyn PullHook>]| {
            hooks.iter().map(|h| h.name().to_string()).collect::<Vec<_>>()
        };
        f.debug_struct("Hooks")
            .field("pre_pull", &names(&self.pre_pull))
            .field("post_pull", &names(&self.post_pull))
            .field("strict", &self.strict)
            .finish()
    }
}

/// Owned copy of a [`HookContext`], for hooks that record what they saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRecord {
    pub point: HookPoint,
    pub collection: String,
    pub asset: String,
    pub tag: String,
    pub path: Option<Utf8PathBuf>,
}

impl HookRecord {
    pub fn capture(point: HookPoint, context: &HookContext<'_>) -> Self {
        Self {
            point,
            collection: context.collection.to_string(),
            asset: context.asset.to_string(),
            tag: context.tag.to_string(),
            path: context.path.map(Utf8Path::to_path_buf),
        }
    }
}
