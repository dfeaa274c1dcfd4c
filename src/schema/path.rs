use derive_more::Display;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// The six dynamic CTF scopes, smallest index outermost.
///
/// The static `env` scope is not listed here: it is addressable by path
/// prefix only and never roots a field path.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
pub enum Scope {
    #[display("trace.packet.header")]
    TracePacketHeader,
    #[display("stream.packet.context")]
    StreamPacketContext,
    #[display("stream.event.header")]
    StreamEventHeader,
    #[display("stream.event.context")]
    StreamEventContext,
    #[display("event.context")]
    EventContext,
    #[display("event.fields")]
    EventPayload,
}

/// TSDL dynamic scope prefixes (CTF section 7.3.2), plus the static
/// environment prefix handled separately by the resolver.
pub(crate) const ENV_PREFIX: &str = "env.";

impl Scope {
    pub const ALL: [Scope; 6] = [
        Scope::TracePacketHeader,
        Scope::StreamPacketContext,
        Scope::StreamEventHeader,
        Scope::StreamEventContext,
        Scope::EventContext,
        Scope::EventPayload,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Scope::TracePacketHeader => 0,
            Scope::StreamPacketContext => 1,
            Scope::StreamEventHeader => 2,
            Scope::StreamEventContext => 3,
            Scope::EventContext => 4,
            Scope::EventPayload => 5,
        }
    }

    /// The scope immediately before this one, if any.
    pub(crate) fn prev(self) -> Option<Scope> {
        match self {
            Scope::TracePacketHeader => None,
            other => Some(Scope::ALL[other.index() - 1]),
        }
    }

    /// The absolute path prefix addressing this scope, with a trailing
    /// separator.
    pub(crate) fn absolute_prefix(self) -> &'static str {
        match self {
            Scope::TracePacketHeader => "trace.packet.header.",
            Scope::StreamPacketContext => "stream.packet.context.",
            Scope::StreamEventHeader => "stream.event.header.",
            Scope::StreamEventContext => "stream.event.context.",
            Scope::EventContext => "event.context.",
            Scope::EventPayload => "event.fields.",
        }
    }

    /// Number of path tokens consumed by the absolute prefix.
    pub(crate) fn prefix_token_count(self) -> usize {
        match self {
            Scope::TracePacketHeader
            | Scope::StreamPacketContext
            | Scope::StreamEventHeader
            | Scope::StreamEventContext => 3,
            Scope::EventContext | Scope::EventPayload => 2,
        }
    }

    /// Matches a path string against the known absolute prefixes.
    pub(crate) fn from_absolute_path(path: &str) -> Option<Scope> {
        Scope::ALL
            .into_iter()
            .find(|scope| path.starts_with(scope.absolute_prefix()))
    }
}

/// An absolute location inside one of the six CTF scopes.
///
/// `indexes` walks compound types from the scope root down; an index of
/// `-1` denotes the element type of an array or sequence (element types
/// have no field index).
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct FieldPath {
    pub root: Scope,
    pub indexes: Vec<i32>,
}

impl FieldPath {
    pub fn new(root: Scope) -> Self {
        Self {
            root,
            indexes: Vec::new(),
        }
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}: {}]",
            self.root,
            self.indexes.iter().map(|i| i.to_string()).join(", ")
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn absolute_prefix_lookup() {
        assert_eq!(
            Scope::from_absolute_path("trace.packet.header.magic"),
            Some(Scope::TracePacketHeader)
        );
        assert_eq!(
            Scope::from_absolute_path("event.fields.len"),
            Some(Scope::EventPayload)
        );
        assert_eq!(Scope::from_absolute_path("some.relative.path"), None);
        assert_eq!(Scope::from_absolute_path("env.host"), None);
    }

    #[test]
    fn scope_ordering_matches_document_order() {
        assert!(Scope::TracePacketHeader < Scope::EventPayload);
        assert_eq!(Scope::StreamEventHeader.prev(), Some(Scope::StreamPacketContext));
        assert_eq!(Scope::TracePacketHeader.prev(), None);
    }

    #[test]
    fn field_path_display() {
        let path = FieldPath {
            root: Scope::StreamPacketContext,
            indexes: vec![1, -1, 0],
        };
        assert_eq!(path.to_string(), "[stream.packet.context: 1, -1, 0]");
    }
}
