//! Lifecycle transitions derived from engine events.

use crate::{EngineEvent, EventKind};

// =============================================================================
// Action Constants
// =============================================================================

/// Engine action names.
pub mod actions {
    // Container
    pub const CREATE: &str = "create";
    pub const START: &str = "start";
    pub const DIE: &str = "die";
    pub const DESTROY: &str = "destroy";
    pub const OOM: &str = "oom";
    /// Exec actions carry the command after a colon (`exec_start: bash`).
    pub const EXEC_START: &str = "exec_start";

    // Image
    pub const PULL: &str = "pull";
    pub const DELETE: &str = "delete";
}

// =============================================================================
// Container Reference
// =============================================================================

/// Identity of a container as carried by its events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerRef {
    pub id: String,
    pub name: String,
    pub image: String,
}

impl ContainerRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: normalize_name(&name.into()),
            image: image.into(),
        }
    }

    /// First 12 characters of the id, as shown by the engine CLI.
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

/// First 12 characters of an engine object id.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Engine inspect output prefixes names with `/`; events do not.
fn normalize_name(name: &str) -> String {
    name.strip_prefix('/').unwrap_or(name).to_string()
}

// =============================================================================
// Classification
// =============================================================================

/// Container lifecycle transitions the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerTransition {
    Created,
    Started,
    Stopped,
    Destroyed,
}

/// Image transitions passed through to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageTransition {
    Pulled,
    Removed,
}

/// Result of classifying one engine event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedEvent {
    Container {
        transition: ContainerTransition,
        container: ContainerRef,
    },
    Image {
        transition: ImageTransition,
        image: String,
    },
    /// Logged, never dispatched.
    Informational {
        kind: EventKind,
        action: String,
        id: String,
    },
    Unhandled {
        kind: EventKind,
        action: String,
    },
}

/// Map an engine event onto a lifecycle transition.
pub fn classify(event: &EngineEvent) -> ClassifiedEvent {
    match event.kind {
        EventKind::Container => classify_container(event),
        EventKind::Image => classify_image(event),
        kind => ClassifiedEvent::Unhandled {
            kind,
            action: event.action.clone(),
        },
    }
}

fn classify_container(event: &EngineEvent) -> ClassifiedEvent {
    let transition = match event.action.as_str() {
        actions::CREATE => ContainerTransition::Created,
        actions::START => ContainerTransition::Started,
        actions::DIE => ContainerTransition::Stopped,
        actions::DESTROY => ContainerTransition::Destroyed,
        action if action == actions::OOM || is_exec_start(action) => {
            return ClassifiedEvent::Informational {
                kind: event.kind,
                action: event.action.clone(),
                id: event.actor.id.clone(),
            };
        }
        _ => {
            return ClassifiedEvent::Unhandled {
                kind: event.kind,
                action: event.action.clone(),
            };
        }
    };

    ClassifiedEvent::Container {
        transition,
        container: ContainerRef::new(
            event.actor.id.clone(),
            event.attribute("name"),
            event.attribute("image"),
        ),
    }
}

fn classify_image(event: &EngineEvent) -> ClassifiedEvent {
    let transition = match event.action.as_str() {
        actions::PULL => ImageTransition::Pulled,
        actions::DELETE => ImageTransition::Removed,
        _ => {
            return ClassifiedEvent::Unhandled {
                kind: event.kind,
                action: event.action.clone(),
            };
        }
    };

    ClassifiedEvent::Image {
        transition,
        image: event.actor.id.clone(),
    }
}

fn is_exec_start(action: &str) -> bool {
    action == actions::EXEC_START
        || action
            .strip_prefix(actions::EXEC_START)
            .is_some_and(|rest| rest.starts_with(':'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn container_event(action: &str) -> EngineEvent {
        EngineEvent::new(EventKind::Container, action, "c0ffee")
            .with_attribute("name", "w1/jupyter")
            .with_attribute("image", "jupyter/base:latest")
    }

    #[rstest]
    #[case("create", ContainerTransition::Created)]
    #[case("start", ContainerTransition::Started)]
    #[case("die", ContainerTransition::Stopped)]
    #[case("destroy", ContainerTransition::Destroyed)]
    fn test_container_transitions(#[case] action: &str, #[case] expected: ContainerTransition) {
        match classify(&container_event(action)) {
            ClassifiedEvent::Container {
                transition,
                container,
            } => {
                assert_eq!(transition, expected);
                assert_eq!(container.id, "c0ffee");
                assert_eq!(container.name, "w1/jupyter");
                assert_eq!(container.image, "jupyter/base:latest");
            }
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[rstest]
    #[case("oom")]
    #[case("exec_start: /bin/sh -c true")]
    #[case("exec_start")]
    fn test_informational(#[case] action: &str) {
        assert!(matches!(
            classify(&container_event(action)),
            ClassifiedEvent::Informational { .. }
        ));
    }

    #[rstest]
    #[case("kill")]
    #[case("exec_create: bash")]
    #[case("exec_started")]
    fn test_unhandled(#[case] action: &str) {
        assert!(matches!(
            classify(&container_event(action)),
            ClassifiedEvent::Unhandled { .. }
        ));
    }

    #[test]
    fn test_image_transitions() {
        let pulled = EngineEvent::new(EventKind::Image, "pull", "ubuntu:22.04");
        assert_eq!(
            classify(&pulled),
            ClassifiedEvent::Image {
                transition: ImageTransition::Pulled,
                image: "ubuntu:22.04".to_string(),
            }
        );

        let removed = EngineEvent::new(EventKind::Image, "delete", "sha256:abc");
        assert!(matches!(
            classify(&removed),
            ClassifiedEvent::Image {
                transition: ImageTransition::Removed,
                ..
            }
        ));

        let tagged = EngineEvent::new(EventKind::Image, "tag", "ubuntu:22.04");
        assert!(matches!(classify(&tagged), ClassifiedEvent::Unhandled { .. }));
    }

    #[test]
    fn test_network_events_unhandled() {
        let event = EngineEvent::new(EventKind::Network, "connect", "n1");
        assert!(matches!(
            classify(&event),
            ClassifiedEvent::Unhandled {
                kind: EventKind::Network,
                ..
            }
        ));
    }

    #[test]
    fn test_short_id_and_name() {
        let c = ContainerRef::new("0123456789abcdef", "/web", "nginx");
        assert_eq!(c.short_id(), "0123456789ab");
        assert_eq!(c.name, "web");
        assert_eq!(short_id("abc"), "abc");
    }
}
