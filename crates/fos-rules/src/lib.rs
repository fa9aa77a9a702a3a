//! fOS Swift Rules
//!
//! Host/path routing rules for the Swift auto-connect engine.
//!
//! A rule maps a site pattern (host, optional path prefix, subdomain scope)
//! to a VPN target. Rules live in an ordered list and the list order is the
//! priority order: the first enabled rule that matches a URL wins, no matter
//! how specific later rules are.
//!
//! ```text
//!   https://www.Docs.Example.com/guide
//!            │
//!            ▼  parse_url()
//!   UrlParts { host: "docs.example.com", path: "/guide" }
//!            │
//!            ▼  select(rules, parts)
//!   [ example.com (+subdomains) ]  ← winner (index 0)
//!   [ docs.example.com /guide   ]  ← also matching, lower priority
//! ```

mod matcher;
mod rule;
mod rule_set;
mod transfer;

pub use matcher::{
    host_label, matches, normalize_host, normalize_path, parse_url, parse_url_input, select,
    Selection, UrlInput, UrlParts,
};
pub use rule::{Rule, RuleKey, TargetType};
pub use rule_set::{MoveDirection, RuleSet};
pub use transfer::{export_rules, import_rules, RuleImportError, EXPORT_VERSION};
