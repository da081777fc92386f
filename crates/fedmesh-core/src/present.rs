//! Operator-facing federation rendering.
//!
//! The output is scraped by scripts, so labels and column layout are
//! stable: a `Federation:` line, the local cluster under `Self:`, then
//! every other member under `Sibling:` sorted by name.

use std::fmt::Write;

use fedmesh_proto::federation::features_str;
use fedmesh_proto::{ClusterRec, Federation};

/// Width of the label column: the length of `"federation:"`.
const LABEL_WIDTH: usize = 11;

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "Yes"
    } else {
        "No"
    }
}

fn cluster_fields(c: &ClusterRec) -> String {
    format!(
        "{}:{}:{} ID:{} FedState:{} Features:{}",
        c.name,
        c.control_host.as_deref().unwrap_or(""),
        c.control_port,
        c.fed_id,
        c.state,
        features_str(&c.features)
    )
}

/// Render a federation as seen from cluster `local`.
///
/// Returns an empty string for no federation or an empty one. Never fails
/// and never mutates its input.
pub fn format_federation(fed: Option<&Federation>, local: &str) -> String {
    let Some(fed) = fed.filter(|f| !f.is_empty()) else {
        return String::new();
    };

    let mut clusters: Vec<&ClusterRec> = fed.clusters.iter().collect();
    clusters.sort_by(|a, b| a.name.cmp(&b.name));

    let mut out = String::new();
    let _ = writeln!(out, "{:<w$} {}", "Federation:", fed.name, w = LABEL_WIDTH);

    if let Some(me) = clusters.iter().find(|c| c.name == local) {
        let _ = writeln!(out, "{:<w$} {}", "Self:", cluster_fields(me), w = LABEL_WIDTH);
    }

    for c in clusters.iter().filter(|c| c.name != local) {
        let link = c.link.unwrap_or_default();
        let _ = writeln!(
            out,
            "{:<w$} {} PersistConnSend/Recv:{}/{} Synced:{}",
            "Sibling:",
            cluster_fields(c),
            yes_no(link.send_connected),
            yes_no(link.recv_connected),
            yes_no(link.sync_recvd),
            w = LABEL_WIDTH
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedmesh_proto::federation::parse_features;
    use fedmesh_proto::{FedState, LinkStatus};

    fn fed_a() -> Federation {
        Federation::new(
            "fedA",
            vec![
                ClusterRec::new("west", 2).with_addr("10.0.0.2", 6817),
                ClusterRec::new("east", 1).with_addr("10.0.0.1", 6817),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_self_then_sibling() {
        let out = format_federation(Some(&fed_a()), "east");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Federation: fedA");
        assert_eq!(
            lines[1],
            "Self:       east:10.0.0.1:6817 ID:1 FedState:ACTIVE Features:"
        );
        assert_eq!(
            lines[2],
            "Sibling:    west:10.0.0.2:6817 ID:2 FedState:ACTIVE Features: \
             PersistConnSend/Recv:No/No Synced:No"
        );
    }

    #[test]
    fn test_siblings_sorted_case_sensitive() {
        let fed = Federation::new(
            "f",
            vec![
                ClusterRec::new("zulu", 4),
                ClusterRec::new("me", 1),
                ClusterRec::new("Bravo", 3),
                ClusterRec::new("alpha", 2),
            ],
        )
        .unwrap();
        let out = format_federation(Some(&fed), "me");
        let names: Vec<&str> = out
            .lines()
            .skip(1)
            .map(|l| l[LABEL_WIDTH + 1..].split(':').next().unwrap())
            .collect();
        assert_eq!(names, vec!["me", "Bravo", "alpha", "zulu"]);
    }

    #[test]
    fn test_deterministic_regardless_of_order() {
        let a = fed_a();
        let mut b = fed_a();
        b.clusters.reverse();
        let first = format_federation(Some(&a), "east");
        assert_eq!(first, format_federation(Some(&a), "east"));
        assert_eq!(first, format_federation(Some(&b), "east"));
    }

    #[test]
    fn test_link_flags_and_features() {
        let mut fed = fed_a();
        let west = &mut fed.clusters[0];
        west.state = FedState::Drain;
        west.features = parse_features("highmem,gpu");
        west.link = Some(LinkStatus {
            send_connected: true,
            recv_connected: false,
            sync_recvd: true,
        });
        let out = format_federation(Some(&fed), "east");
        assert!(out.contains(
            "west:10.0.0.2:6817 ID:2 FedState:DRAIN Features:gpu,highmem \
             PersistConnSend/Recv:Yes/No Synced:Yes"
        ));
    }

    #[test]
    fn test_unknown_local_has_no_self_line() {
        let out = format_federation(Some(&fed_a()), "north");
        assert!(!out.contains("Self:"));
        assert_eq!(out.lines().filter(|l| l.starts_with("Sibling:")).count(), 2);
    }

    #[test]
    fn test_empty_renders_nothing() {
        assert_eq!(format_federation(None, "east"), "");
        let empty = Federation {
            name: "fedA".to_string(),
            clusters: Vec::new(),
        };
        assert_eq!(format_federation(Some(&empty), "east"), "");
    }
}
