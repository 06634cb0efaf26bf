// -
// Store namespace

/// Node path separator in the coordination store namespace
pub(crate) const PATH_SEPARATOR: &str = "/";

/// Service name that subscribes to every service under the root
pub const ANY_SERVICE: &str = "*";

// -
// Descriptor parameter keys

/// Overrides the descriptor path as the logical service name
pub(crate) const INTERFACE_KEY: &str = "interface";

pub(crate) const GROUP_KEY: &str = "group";
pub(crate) const VERSION_KEY: &str = "version";
pub(crate) const CLASSIFIER_KEY: &str = "classifier";
pub(crate) const ENABLED_KEY: &str = "enabled";

/// Whether a subscriber insists on live providers at subscribe time
pub(crate) const CHECK_KEY: &str = "check";

/// Whether a subscriber also announces itself as a provider
pub(crate) const REGISTER_KEY: &str = "register";

/// Admin subscribers get themselves back (empty protocol) when no provider matches
pub(crate) const ADMIN_KEY: &str = "admin";

// -
// Protocols with special node semantics

/// Routing rules are persistent nodes, they outlive the publishing session
pub(crate) const ROUTE_PROTOCOL: &str = "route";

/// Placeholder protocol for "no providers" notifications
pub(crate) const EMPTY_PROTOCOL: &str = "empty";
