//! Topology rendering: dump the simulated network as a DOT digraph.

use crate::packet::{Route, Sink};
use crate::Simulation;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::io;
use std::path::Path;
use std::rc::Rc;

fn node_id(sink: &Rc<dyn Sink>) -> usize {
    Rc::as_ptr(sink) as *const () as usize
}

fn escape_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for c in label.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}

struct NodeSet {
    labels: BTreeMap<usize, (String, String)>,
    members: BTreeSet<usize>,
}

impl NodeSet {
    fn new() -> Self {
        Self {
            labels: BTreeMap::new(),
            members: BTreeSet::new(),
        }
    }

    fn insert(&mut self, sink: &Rc<dyn Sink>) -> usize {
        let id = node_id(sink);
        self.members.insert(id);
        self.labels
            .entry(id)
            .or_insert_with(|| (sink.label(), sink.attributes()));
        id
    }
}

/// Write the network topology as a DOT directed graph: one cluster per
/// host (its endpoint plus ingress/egress chains), the shared network
/// nodes, and edges composed from the per-host chains and the pairwise
/// channel routes.
pub fn dump_network_graph(sim: &Simulation, path: impl AsRef<Path>) -> io::Result<()> {
    let mut edges: BTreeSet<(usize, usize)> = BTreeSet::new();
    let mut network = NodeSet::new();
    // Per-host clusters: (endpoint id, endpoint label, member nodes).
    let mut clusters: Vec<(usize, String, NodeSet)> = Vec::new();

    let hosts: Vec<_> = sim
        .core
        .hosts
        .borrow()
        .iter()
        .filter_map(|weak| weak.upgrade())
        .collect();

    for host in &hosts {
        // The host itself is rendered as a pseudo-node keyed by its
        // allocation address.
        let host_id = Rc::as_ptr(host) as usize;
        let label = host
            .ips
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let mut local = NodeSet::new();

        for ip in &host.ips {
            let incoming = host.incoming_route(*ip);
            let outgoing = host.outgoing_route(*ip);

            // Ingress chain: network -> ... -> host.
            let mut prev = None;
            for hop in incoming.iter() {
                let id = local.insert(hop);
                if let Some(prev) = prev {
                    edges.insert((prev, id));
                }
                prev = Some(id);
            }
            if let Some(prev) = prev {
                edges.insert((prev, host_id));
            }

            // Egress chain: host -> ... -> network.
            let mut prev = host_id;
            for hop in outgoing.iter() {
                let id = local.insert(hop);
                edges.insert((prev, id));
                prev = id;
            }
            let egress = prev;

            // Connect the egress to every other endpoint through the
            // configured channel route.
            for other in &hosts {
                for ip2 in &other.ips {
                    let channel: Route = sim
                        .core
                        .config
                        .borrow_mut()
                        .channel_route(sim, *ip, *ip2);
                    let entry = other
                        .incoming_route(*ip2)
                        .next_hop()
                        .map(|hop| network.insert(&hop))
                        .unwrap_or(Rc::as_ptr(other) as usize);

                    let mut prev = egress;
                    for hop in channel.iter() {
                        let id = network.insert(hop);
                        edges.insert((prev, id));
                        prev = id;
                    }
                    edges.insert((prev, entry));
                }
            }
        }

        clusters.push((host_id, label, local));
    }

    let mut out = String::new();
    let _ = writeln!(out, "digraph network {{");
    let _ = writeln!(out, "concentrate=true;");
    let _ = writeln!(out, "overlap=scale;");
    let _ = writeln!(out, "splines=true;");

    let _ = writeln!(out, "\n// network nodes\n");
    for (id, (label, attributes)) in &network.labels {
        let _ = writeln!(
            out,
            " \"{id}\" [label=\"{}\",style=\"filled\",color=\"red\", {attributes}];",
            escape_label(label),
        );
    }

    let _ = writeln!(out, "\n// local networks\n");
    for (idx, (host_id, host_label, local)) in clusters.iter().enumerate() {
        let _ = writeln!(out, "subgraph cluster_{idx} {{");
        let _ = writeln!(
            out,
            " \"{host_id}\" [label=\"{}\",style=\"filled\",color=\"green\", shape=ellipse];",
            escape_label(host_label),
        );
        for (id, (label, attributes)) in &local.labels {
            let _ = writeln!(
                out,
                " \"{id}\" [label=\"{}\",style=\"filled\",color=\"green\", {attributes}];",
                escape_label(label),
            );
        }
        let _ = writeln!(out, "}}");
    }

    let _ = writeln!(out, "\n// edges\n");
    for (from, to) in &edges {
        let _ = writeln!(out, "\"{from}\" -> \"{to}\"");
    }
    let _ = writeln!(out, "}}");

    std::fs::write(path, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DefaultConfig, Host};

    #[test]
    fn dump_renders_hosts_and_network() {
        let sim = Simulation::new(DefaultConfig::default());
        let _a = Host::new(&sim, ["10.0.0.1".parse().unwrap()]);
        let _b = Host::new(&sim, ["10.0.0.2".parse().unwrap()]);

        let path = std::env::temp_dir().join("simnet-graph-test.dot");
        dump_network_graph(&sim, &path).unwrap();
        let rendered = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert!(rendered.starts_with("digraph network {"));
        assert!(rendered.contains("cluster_0"));
        assert!(rendered.contains("cluster_1"));
        assert!(rendered.contains("network"));
        assert!(rendered.contains("modem in\\n10.0.0.1"));
        assert!(rendered.contains("->"));
    }
}
