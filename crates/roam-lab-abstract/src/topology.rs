use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, TopologyConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// The roaming node whose anchor links are shaped over time.
    Mobile,
    /// A fixed relay the mobile node may attach to.
    Anchor,
    /// A stationary node running a worker under test.
    Participant,
}

/// Planar position in metres, used by the trajectory mobility policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    /// Linear interpolation towards `other`, `t` in [0, 1].
    pub fn lerp(&self, other: &Position, t: f64) -> Position {
        let t = t.clamp(0.0, 1.0);
        Position::new(
            self.x + (other.x - self.x) * t,
            self.y + (other.y - self.y) * t,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub role: NodeRole,
    pub position: Option<Position>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub id: LinkId,
    pub a: String,
    pub b: String,
    pub delay_ms: u64,
}

impl Link {
    pub fn connects(&self, x: &str, y: &str) -> bool {
        (self.a == x && self.b == y) || (self.a == y && self.b == x)
    }
}

/// Static description of the emulated network. Providers are built from it;
/// the orchestrator never mutates it after construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologySpec {
    nodes: Vec<Node>,
    links: Vec<Link>,
}

impl TopologySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: impl Into<String>, role: NodeRole) -> Result<(), ConfigError> {
        let name = name.into();
        if self.node(&name).is_some() {
            return Err(ConfigError::DuplicateNode(name));
        }
        if role == NodeRole::Mobile && self.mobile().is_some() {
            return Err(ConfigError::InvalidTopology(
                "only one mobile node is supported".to_string(),
            ));
        }
        self.nodes.push(Node {
            name,
            role,
            position: None,
        });
        Ok(())
    }

    pub fn set_position(&mut self, name: &str, position: Position) -> Result<(), ConfigError> {
        let node = self
            .nodes
            .iter_mut()
            .find(|n| n.name == name)
            .ok_or_else(|| ConfigError::UnknownNode(name.to_string()))?;
        node.position = Some(position);
        Ok(())
    }

    pub fn add_link(&mut self, a: &str, b: &str, delay_ms: u64) -> Result<LinkId, ConfigError> {
        for end in [a, b] {
            if self.node(end).is_none() {
                return Err(ConfigError::UnknownNode(end.to_string()));
            }
        }
        let id = LinkId(self.links.len());
        self.links.push(Link {
            id,
            a: a.to_string(),
            b: b.to_string(),
            delay_ms,
        });
        Ok(id)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(id.0)
    }

    pub fn mobile(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.role == NodeRole::Mobile)
    }

    /// Anchors in insertion order; the index in this list is the anchor index.
    pub fn anchors(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.role == NodeRole::Anchor)
            .collect()
    }

    pub fn participants(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.role == NodeRole::Participant)
            .collect()
    }

    /// The link between the mobile node and anchor `k`.
    pub fn anchor_link(&self, k: usize) -> Option<LinkId> {
        let mobile = self.mobile()?;
        let anchor = self.anchors().get(k).copied()?;
        self.links
            .iter()
            .find(|l| l.connects(&mobile.name, &anchor.name))
            .map(|l| l.id)
    }

    /// Index of the anchor a participant hangs off, if it is linked to one.
    pub fn attached_anchor(&self, participant: &str) -> Option<usize> {
        self.anchors()
            .iter()
            .position(|anchor| self.links.iter().any(|l| l.connects(&anchor.name, participant)))
    }

    /// Star-of-stars layout: one mobile node linked to every anchor, each
    /// anchor linked to its own group of participants.
    pub fn platoons(config: &TopologyConfig) -> Result<Self, ConfigError> {
        if config.anchors == 0 {
            return Err(ConfigError::InvalidTopology(
                "at least one anchor is required".to_string(),
            ));
        }
        let positions = config.anchor_positions();
        let mut spec = TopologySpec::new();
        spec.add_node(config.mobile_name.clone(), NodeRole::Mobile)?;
        for i in 0..config.anchors {
            let anchor = format!("ap{i}");
            spec.add_node(anchor.clone(), NodeRole::Anchor)?;
            spec.set_position(&anchor, positions[i])?;
            spec.add_link(&config.mobile_name, &anchor, config.link_delay_ms)?;
            for j in 0..config.participants_per_anchor {
                let unit = format!("unit_{i}_{j}");
                spec.add_node(unit.clone(), NodeRole::Participant)?;
                spec.add_link(&anchor, &unit, config.link_delay_ms)?;
            }
        }
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platoon_layout() {
        let config = TopologyConfig {
            anchors: 4,
            participants_per_anchor: 5,
            ..Default::default()
        };
        let spec = TopologySpec::platoons(&config).unwrap();

        assert_eq!(spec.nodes().len(), 1 + 4 + 20);
        assert_eq!(spec.links().len(), 4 + 20);
        assert_eq!(spec.anchors().len(), 4);
        assert_eq!(spec.mobile().unwrap().name, "uav");
        assert_eq!(spec.attached_anchor("unit_2_3"), Some(2));

        let link = spec.link(spec.anchor_link(3).unwrap()).unwrap();
        assert!(link.connects("uav", "ap3"));
        assert_eq!(link.delay_ms, 10);
    }

    #[test]
    fn test_rejects_unknown_link_endpoint() {
        let mut spec = TopologySpec::new();
        spec.add_node("a", NodeRole::Anchor).unwrap();
        assert!(matches!(
            spec.add_link("a", "b", 10),
            Err(ConfigError::UnknownNode(name)) if name == "b"
        ));
        assert!(matches!(
            spec.add_node("a", NodeRole::Participant),
            Err(ConfigError::DuplicateNode(_))
        ));
    }

    #[test]
    fn test_lerp_and_distance() {
        let a = Position::new(0.0, 0.0);
        let b = Position::new(300.0, 400.0);
        assert_eq!(a.distance_to(&b), 500.0);
        assert_eq!(a.lerp(&b, 0.5), Position::new(150.0, 200.0));
        assert_eq!(a.lerp(&b, 2.0), b);
    }
}
