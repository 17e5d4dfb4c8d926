/// Actor recorded when nobody can be identified.
pub const SYSTEM_ACTOR: &str = "system";

/// Source of the acting user for a mutation.
pub trait IdentityProvider: Send + Sync {
    fn current_actor(&self) -> Option<String>;
}

/// No session available; every mutation is attributed to [`SYSTEM_ACTOR`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl IdentityProvider for Anonymous {
    fn current_actor(&self) -> Option<String> {
        None
    }
}

/// A fixed actor, e.g. the operator running the CLI.
#[derive(Debug, Clone)]
pub struct FixedActor(pub String);

impl IdentityProvider for FixedActor {
    fn current_actor(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Dashboard users are identified by display name, falling back to email.
#[derive(Debug, Clone, Default)]
pub struct SessionUser {
    pub name: Option<String>,
    pub email: Option<String>,
}

impl IdentityProvider for SessionUser {
    fn current_actor(&self) -> Option<String> {
        non_blank(self.name.as_deref()).or_else(|| non_blank(self.email.as_deref()))
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Explicit actor first, then the provider, then [`SYSTEM_ACTOR`].
pub fn resolve_actor(explicit: Option<&str>, provider: &dyn IdentityProvider) -> String {
    non_blank(explicit)
        .or_else(|| non_blank(provider.current_actor().as_deref()))
        .unwrap_or_else(|| SYSTEM_ACTOR.to_string())
}
