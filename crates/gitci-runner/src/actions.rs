//! Well-known `uses:` actions with native equivalents.

use gitci_core::pipeline::EnvVars;

/// Setup actions with a host equivalent.
const SETUP_TOOLS: &[&str] = &["go", "node", "python"];

/// What a `uses:` reference maps to on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnownAction {
    /// `actions/checkout`: refresh the existing checkout.
    Checkout,
    /// `actions/setup-{go,node,python}`: check the tool is installed.
    Setup { tool: String, version: String },
    /// Anything else is skipped.
    Unsupported { action: String, version: String },
}

impl KnownAction {
    /// Resolve `owner/name@ref`. The version of a setup action comes from
    /// its `<tool>-version` input, else the ref, else `latest`.
    pub fn resolve(reference: &str, with: &EnvVars) -> Self {
        let (action, version) = match reference.split_once('@') {
            Some((action, version)) => (action, version.to_string()),
            None => (reference, "latest".to_string()),
        };

        if action == "actions/checkout" {
            return KnownAction::Checkout;
        }

        if let Some(tool) = action
            .strip_prefix("actions/setup-")
            .filter(|tool| SETUP_TOOLS.contains(tool))
        {
            let version = with
                .get(&format!("{}-version", tool))
                .cloned()
                .unwrap_or(version);
            return KnownAction::Setup {
                tool: tool.to_string(),
                version,
            };
        }

        KnownAction::Unsupported {
            action: action.to_string(),
            version,
        }
    }

    /// Command that reports the installed version of a setup tool.
    pub fn version_probe(tool: &str) -> (String, Vec<String>) {
        match tool {
            "go" => ("go".to_string(), vec!["version".to_string()]),
            "python" => ("python3".to_string(), vec!["--version".to_string()]),
            other => (other.to_string(), vec!["--version".to_string()]),
        }
    }

    /// Human readable plan for dry runs.
    pub fn describe(&self) -> String {
        match self {
            KnownAction::Checkout => "git fetch --all --tags".to_string(),
            KnownAction::Setup { tool, version } => {
                let (program, args) = Self::version_probe(tool);
                format!("check {} {}: {} {}", tool, version, program, args.join(" "))
            }
            KnownAction::Unsupported { action, version } => {
                format!("skip unsupported action {}@{}", action, version)
            }
        }
    }
}
