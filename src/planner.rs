//! Diff planning between a client report and the server's inventory

use crate::fs_enum::Inventory;

/// What the server will do for one path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedAction {
    /// Client already holds the server's content
    Keep,
    /// Client holds a path the server does not have
    Delete,
    /// Stream the server's bytes, then COMPLETE
    Transfer,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub entries: Vec<(String, PlannedAction)>,
}

impl Plan {
    pub fn count(&self, action: PlannedAction) -> usize {
        self.entries.iter().filter(|(_, a)| *a == action).count()
    }

    pub fn action_for(&self, path: &str) -> Option<PlannedAction> {
        self.entries.iter().find(|(p, _)| p == path).map(|(_, a)| *a)
    }

    pub fn is_noop(&self) -> bool {
        self.entries.iter().all(|(_, a)| *a == PlannedAction::Keep)
    }
}

/// Classify every path known to either side.
///
/// Deletes come first, then keeps, then transfers. Receivers must not rely
/// on this order; it only lets the cheap messages go out before the
/// transfers start competing for pool slots.
pub fn plan(client: &Inventory, server: &Inventory) -> Plan {
    let mut deletes = Vec::new();
    let mut keeps = Vec::new();
    let mut transfers = Vec::new();

    for path in client.paths() {
        if !server.contains(path) {
            deletes.push((path.to_string(), PlannedAction::Delete));
        }
    }

    for (path, digest) in server.iter() {
        match client.get(path) {
            Some(theirs) if theirs == digest => keeps.push((path.to_string(), PlannedAction::Keep)),
            _ => transfers.push((path.to_string(), PlannedAction::Transfer)),
        }
    }

    let mut entries = deletes;
    entries.extend(keeps);
    entries.extend(transfers);
    Plan { entries }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Digest;

    fn inv(items: &[(&str, &str)]) -> Inventory {
        items
            .iter()
            .map(|(p, c)| (p.to_string(), Digest::of_bytes(c.as_bytes())))
            .collect()
    }

    #[test]
    fn test_reference_scenario() {
        let client = inv(&[("a.txt", "X"), ("b.txt", "old")]);
        let server = inv(&[("a.txt", "X"), ("c.txt", "new")]);
        let p = plan(&client, &server);

        assert_eq!(p.action_for("a.txt"), Some(PlannedAction::Keep));
        assert_eq!(p.action_for("b.txt"), Some(PlannedAction::Delete));
        assert_eq!(p.action_for("c.txt"), Some(PlannedAction::Transfer));
        assert_eq!(p.entries.len(), 3);
        assert!(!p.is_noop());
    }

    #[test]
    fn test_changed_content_transfers() {
        let p = plan(&inv(&[("a.txt", "v1")]), &inv(&[("a.txt", "v2")]));
        assert_eq!(p.entries, vec![("a.txt".to_string(), PlannedAction::Transfer)]);
    }

    #[test]
    fn test_identical_trees_are_noop() {
        let t = inv(&[("a", "1"), ("d/b", "2")]);
        let p = plan(&t, &t);
        assert!(p.is_noop());
        assert_eq!(p.count(PlannedAction::Keep), 2);
    }

    #[test]
    fn test_empty_sides() {
        let t = inv(&[("a", "1"), ("b", "2")]);
        let to_empty = plan(&t, &Inventory::new());
        assert_eq!(to_empty.count(PlannedAction::Delete), 2);
        let from_empty = plan(&Inventory::new(), &t);
        assert_eq!(from_empty.count(PlannedAction::Transfer), 2);
        assert!(plan(&Inventory::new(), &Inventory::new()).entries.is_empty());
    }
}
