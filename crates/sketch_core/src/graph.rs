//! Constraint graphs and their decomposition into rigid clusters.
//!
//! A graph is split at an articulation pair `(a, b)`: the part hanging off
//! `b` (with `a` removed) is cut apart first, then `a` is put back and the
//! result is cut at `a`. Every cut vertex is replaced by one clone per
//! component, `{id}_{index}`. When a component still has an articulation
//! point after the second cut, its clones of `a` and `b` are linked so the
//! relation severed by the split is kept.
//!
//! Splits never modify their input; each step builds a new graph.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, warn};

/// Resource guard for [`decompose`].
pub const MAX_DECOMPOSITION_STEPS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Point,
    Line,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Distance,
    Angle,
    Connection,
    /// Added by decomposition; carries no geometric meaning.
    Virtual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EdgeKind,
    pub source: String,
    pub target: String,
}

impl Edge {
    pub fn touches(&self, id: &str) -> bool {
        self.source == id || self.target == id
    }

    /// True when the edge joins `a` and `b` in either direction.
    pub fn connects(&self, a: &str, b: &str) -> bool {
        (self.source == a && self.target == b) || (self.source == b && self.target == a)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintGraph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

/// Two node ids, in ascending order.
pub type ArticulationPair = (String, String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecomposeError {
    #[error("Node \"{0}\" is not in the graph")]
    UnknownNode(String),
    #[error("Decomposition stopped after {steps} steps with articulation pairs left")]
    Incomplete { steps: usize, graph: ConstraintGraph },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decomposition {
    pub graph: ConstraintGraph,
    pub steps: usize,
}

/// Index-based view of a graph. Edges naming unknown nodes are ignored.
struct Adjacency<'a> {
    index: HashMap<&'a str, usize>,
    neighbors: Vec<Vec<usize>>,
}

impl<'a> Adjacency<'a> {
    fn new(graph: &'a ConstraintGraph) -> Self {
        let mut index = HashMap::with_capacity(graph.nodes.len());
        for (i, node) in graph.nodes.iter().enumerate() {
            index.entry(node.id.as_str()).or_insert(i);
        }

        let mut neighbors = vec![Vec::new(); graph.nodes.len()];
        for edge in &graph.edges {
            let (Some(&s), Some(&t)) = (
                index.get(edge.source.as_str()),
                index.get(edge.target.as_str()),
            ) else {
                continue;
            };
            neighbors[s].push(t);
            if s != t {
                neighbors[t].push(s);
            }
        }

        Self { index, neighbors }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }
}

impl ConstraintGraph {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Copy of the graph without `id` and every edge touching it.
    pub fn without_node(&self, id: &str) -> ConstraintGraph {
        ConstraintGraph {
            nodes: self.nodes.iter().filter(|n| n.id != id).cloned().collect(),
            edges: self.edges.iter().filter(|e| !e.touches(id)).cloned().collect(),
        }
    }

    /// Connected components, in order of their first node. Nodes appear in
    /// discovery order and every edge lands in exactly one component.
    pub fn components(&self) -> Vec<ConstraintGraph> {
        let adjacency = Adjacency::new(self);
        let mut component_of: Vec<Option<usize>> = vec![None; self.nodes.len()];
        let mut components: Vec<ConstraintGraph> = Vec::new();

        for start in 0..self.nodes.len() {
            if component_of[start].is_some() {
                continue;
            }
            let current = components.len();
            let mut component = ConstraintGraph::default();
            let mut stack = vec![start];
            component_of[start] = Some(current);

            while let Some(i) = stack.pop() {
                component.nodes.push(self.nodes[i].clone());
                for &j in adjacency.neighbors[i].iter().rev() {
                    if component_of[j].is_none() {
                        component_of[j] = Some(current);
                        stack.push(j);
                    }
                }
            }
            components.push(component);
        }

        for edge in &self.edges {
            let (Some(s), Some(t)) = (
                adjacency.position(&edge.source),
                adjacency.position(&edge.target),
            ) else {
                continue;
            };
            if let (Some(cs), Some(ct)) = (component_of[s], component_of[t]) {
                if cs == ct {
                    components[cs].edges.push(edge.clone());
                }
            }
        }

        components
    }

    fn extend(&mut self, other: ConstraintGraph) {
        self.nodes.extend(other.nodes);
        self.edges.extend(other.edges);
    }
}

/// Depth-first low-link search state.
struct LowLink<'g> {
    neighbors: &'g [Vec<usize>],
    depth: Vec<Option<usize>>,
    low: Vec<usize>,
    parent: Vec<Option<usize>>,
    points: Vec<usize>,
}

/// One node on the explicit search stack.
struct Frame {
    node: usize,
    depth: usize,
    cursor: usize,
    children: usize,
    cut: bool,
}

impl Frame {
    fn new(node: usize, depth: usize) -> Self {
        Self {
            node,
            depth,
            cursor: 0,
            children: 0,
            cut: false,
        }
    }
}

impl LowLink<'_> {
    /// Searches the component of `root`, recording articulation points in
    /// the order their subtrees finish.
    fn search(&mut self, root: usize) {
        let neighbors = self.neighbors;
        self.depth[root] = Some(0);
        self.low[root] = 0;
        let mut stack = vec![Frame::new(root, 0)];

        while let Some(frame) = stack.last_mut() {
            let node = frame.node;
            if let Some(&next) = neighbors[node].get(frame.cursor) {
                frame.cursor += 1;
                match self.depth[next] {
                    None => {
                        frame.children += 1;
                        let depth = frame.depth + 1;
                        self.parent[next] = Some(node);
                        self.depth[next] = Some(depth);
                        self.low[next] = depth;
                        stack.push(Frame::new(next, depth));
                    }
                    Some(next_depth) => {
                        if self.parent[node] != Some(next) {
                            self.low[node] = self.low[node].min(next_depth);
                        }
                    }
                }
                continue;
            }

            let Some(done) = stack.pop() else { break };
            let is_root = self.parent[done.node].is_none();
            if (is_root && done.children > 1) || (!is_root && done.cut) {
                self.points.push(done.node);
            }
            if let Some(up) = stack.last_mut() {
                // No back edge from the finished subtree climbs above `up`.
                if self.low[done.node] >= up.depth {
                    up.cut = true;
                }
                self.low[up.node] = self.low[up.node].min(self.low[done.node]);
            }
        }
    }
}

/// Vertices whose removal disconnects their component, in the order the
/// search finishes them. Every component is searched.
pub fn articulation_points(graph: &ConstraintGraph) -> Vec<String> {
    let adjacency = Adjacency::new(graph);
    let n = graph.nodes.len();
    let mut search = LowLink {
        neighbors: &adjacency.neighbors,
        depth: vec![None; n],
        low: vec![0; n],
        parent: vec![None; n],
        points: Vec::new(),
    };

    for start in 0..n {
        if search.depth[start].is_none() {
            search.search(start);
        }
    }

    search
        .points
        .into_iter()
        .map(|i| graph.nodes[i].id.clone())
        .collect()
}

/// Pairs `(a, b)` such that `b` is an articulation point once `a` is
/// removed. Each unordered pair is reported once, ids sorted.
pub fn articulation_pairs(graph: &ConstraintGraph) -> Vec<ArticulationPair> {
    let mut seen = HashSet::new();
    let mut pairs = Vec::new();

    for node in &graph.nodes {
        let reduced = graph.without_node(&node.id);
        for point in articulation_points(&reduced) {
            let pair = if node.id <= point {
                (node.id.clone(), point)
            } else {
                (point, node.id.clone())
            };
            if seen.insert(pair.clone()) {
                pairs.push(pair);
            }
        }
    }

    pairs
}

/// How the second cut of a pair split links the two pivots' clones.
struct PairLink<'a> {
    partner: &'a str,
    partner_clones: HashSet<String>,
    kind: EdgeKind,
}

/// Cuts `graph` at `pivot`, returning the new graph and the clone ids made.
fn split_at(
    graph: &ConstraintGraph,
    pivot: &str,
    link: Option<&PairLink<'_>>,
) -> Result<(ConstraintGraph, Vec<String>), DecomposeError> {
    let pivot_node = graph
        .node(pivot)
        .ok_or_else(|| DecomposeError::UnknownNode(pivot.to_string()))?;

    let mut result = ConstraintGraph::default();
    let mut clones = Vec::new();

    for (i, mut component) in graph.without_node(pivot).components().into_iter().enumerate() {
        let clone_id = format!("{pivot}_{i}");
        let members: HashSet<&str> = component.nodes.iter().map(|n| n.id.as_str()).collect();

        let mut reattached = Vec::new();
        for edge in &graph.edges {
            if edge.source == pivot && members.contains(edge.target.as_str()) {
                reattached.push(Edge {
                    source: clone_id.clone(),
                    ..edge.clone()
                });
            } else if edge.target == pivot && members.contains(edge.source.as_str()) {
                reattached.push(Edge {
                    target: clone_id.clone(),
                    ..edge.clone()
                });
            }
        }

        if !reattached.is_empty() {
            component.nodes.push(Node {
                id: clone_id.clone(),
                kind: pivot_node.kind,
            });
            component.edges.extend(reattached);

            if let Some(link) = link {
                if !articulation_points(&component).is_empty() {
                    let partner = component
                        .nodes
                        .iter()
                        .find(|n| link.partner_clones.contains(&n.id))
                        .map(|n| n.id.clone());
                    if let Some(partner) = partner {
                        component.edges.push(Edge {
                            id: format!("{}_virtual_edge_{i}", link.partner),
                            kind: link.kind,
                            source: clone_id.clone(),
                            target: partner,
                        });
                    }
                }
            }
            clones.push(clone_id);
        }

        result.extend(component);
    }

    Ok((result, clones))
}

/// Replaces `point` with one clone per component it joins.
pub fn split_at_articulation_point(
    graph: &ConstraintGraph,
    point: &str,
) -> Result<ConstraintGraph, DecomposeError> {
    split_at(graph, point, None).map(|(split, _)| split)
}

pub fn split_at_articulation_pair(
    graph: &ConstraintGraph,
    pair: &ArticulationPair,
) -> Result<ConstraintGraph, DecomposeError> {
    let (first, second) = (pair.0.as_str(), pair.1.as_str());
    let first_node = graph
        .node(first)
        .ok_or_else(|| DecomposeError::UnknownNode(first.to_string()))?;

    // A direct edge between the pivots lends its type to the links.
    let kind = graph
        .edges
        .iter()
        .find(|e| e.connects(first, second))
        .map_or(EdgeKind::Virtual, |e| e.kind);

    let (mut split, clones) = split_at(&graph.without_node(first), second, None)?;

    split.nodes.push(first_node.clone());
    split
        .edges
        .extend(graph.edges.iter().filter(|e| e.touches(first)).cloned());

    let link = PairLink {
        partner: second,
        partner_clones: clones.into_iter().collect(),
        kind,
    };
    let (result, _) = split_at(&split, first, Some(&link))?;
    Ok(result)
}

/// One decomposition step: splits at the first articulation pair, or
/// returns a copy when there is none.
pub fn split_first_articulation_pair(
    graph: &ConstraintGraph,
) -> Result<ConstraintGraph, DecomposeError> {
    match articulation_pairs(graph).first() {
        Some(pair) => split_at_articulation_pair(graph, pair),
        None => Ok(graph.clone()),
    }
}

pub fn decompose(graph: &ConstraintGraph) -> Result<Decomposition, DecomposeError> {
    decompose_with_limit(graph, MAX_DECOMPOSITION_STEPS)
}

/// Splits at articulation pairs until none remain. Running out of steps
/// first is reported as `Incomplete` with the graph reached so far.
pub fn decompose_with_limit(
    graph: &ConstraintGraph,
    max_steps: usize,
) -> Result<Decomposition, DecomposeError> {
    let mut graph = graph.clone();
    let mut steps = 0;

    loop {
        let pairs = articulation_pairs(&graph);
        let Some(pair) = pairs.first() else {
            return Ok(Decomposition { graph, steps });
        };
        if steps >= max_steps {
            warn!(steps, remaining_pairs = pairs.len(), "decomposition step cap reached");
            return Err(DecomposeError::Incomplete { steps, graph });
        }

        debug!(step = steps, first = %pair.0, second = %pair.1, "splitting at articulation pair");
        graph = split_at_articulation_pair(&graph, pair)?;
        steps += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: &str) -> Node {
        Node {
            id: id.to_string(),
            kind: NodeKind::Point,
        }
    }

    fn line(id: &str) -> Node {
        Node {
            id: id.to_string(),
            kind: NodeKind::Line,
        }
    }

    fn edge(id: &str, kind: EdgeKind, source: &str, target: &str) -> Edge {
        Edge {
            id: id.to_string(),
            kind,
            source: source.to_string(),
            target: target.to_string(),
        }
    }

    fn distance(id: &str, source: &str, target: &str) -> Edge {
        edge(id, EdgeKind::Distance, source, target)
    }

    fn square(with_cross_edge: bool) -> ConstraintGraph {
        let mut edges = vec![
            distance("edge1", "point1", "point2"),
            distance("edge2", "point2", "point3"),
            distance("edge3", "point3", "point4"),
            distance("edge4", "point4", "point1"),
        ];
        if with_cross_edge {
            edges.push(distance("edge5", "point1", "point3"));
        }
        ConstraintGraph::new(
            vec![point("point1"), point("point2"), point("point3"), point("point4")],
            edges,
        )
    }

    fn zou() -> ConstraintGraph {
        use EdgeKind::{Angle, Connection};
        let nodes = ["point1", "point2", "point3", "point4"]
            .into_iter()
            .map(point)
            .chain(["line1", "line2", "line3", "line4"].into_iter().map(line))
            .collect();
        let edges = vec![
            edge("edge1", Angle, "line1", "line4"),
            distance("edge3", "point1", "point2"),
            distance("edge4", "point2", "point3"),
            distance("edge5", "point3", "point4"),
            distance("edge7", "point4", "point1"),
            edge("edge8", Connection, "line1", "point1"),
            edge("edge9", Connection, "line2", "point1"),
            edge("edge10", Connection, "line2", "point2"),
            edge("edge11", Connection, "line3", "point2"),
            edge("edge12", Connection, "line3", "point3"),
            edge("edge13", Connection, "line4", "point3"),
            edge("edge14", Connection, "line4", "point4"),
            edge("edge15", Connection, "line1", "point4"),
        ];
        ConstraintGraph::new(nodes, edges)
    }

    fn ids(nodes: &[Node]) -> Vec<&str> {
        nodes.iter().map(|n| n.id.as_str()).collect()
    }

    #[test]
    fn path_middle_is_an_articulation_point() {
        let graph = ConstraintGraph::new(
            vec![point("a"), point("b"), point("c")],
            vec![distance("e1", "a", "b"), distance("e2", "b", "c")],
        );
        assert_eq!(articulation_points(&graph), vec!["b"]);
    }

    #[test]
    fn long_chains_do_not_exhaust_the_stack() {
        const LEN: usize = 200_000;
        let nodes = (0..LEN).map(|i| point(&format!("p{i}"))).collect();
        let edges = (1..LEN)
            .map(|i| distance(&format!("e{i}"), &format!("p{}", i - 1), &format!("p{i}")))
            .collect();
        let points = articulation_points(&ConstraintGraph::new(nodes, edges));

        assert_eq!(points.len(), LEN - 2);
        assert_eq!(points.first().map(String::as_str), Some("p199998"));
        assert_eq!(points.last().map(String::as_str), Some("p1"));
    }

    #[test]
    fn root_is_a_cut_vertex_only_with_several_children() {
        let star = ConstraintGraph::new(
            vec![point("hub"), point("a"), point("b")],
            vec![distance("e1", "hub", "a"), distance("e2", "hub", "b")],
        );
        assert_eq!(articulation_points(&star), vec!["hub"]);

        let edge_only = ConstraintGraph::new(
            vec![point("a"), point("b")],
            vec![distance("e1", "a", "b")],
        );
        assert!(articulation_points(&edge_only).is_empty());
    }

    #[test]
    fn every_component_is_searched() {
        let graph = ConstraintGraph::new(
            vec![point("a"), point("b"), point("c"), point("x"), point("y"), point("z")],
            vec![
                distance("e1", "a", "b"),
                distance("e2", "b", "c"),
                distance("e3", "x", "y"),
                distance("e4", "y", "z"),
            ],
        );
        assert_eq!(articulation_points(&graph), vec!["b", "y"]);
        assert_eq!(graph.components().len(), 2);
    }

    #[test]
    fn components_keep_isolated_nodes_and_each_edge_once() {
        let graph = ConstraintGraph::new(
            vec![point("a"), point("lonely"), point("b")],
            vec![distance("e1", "a", "b"), distance("e2", "b", "a")],
        );
        let components = graph.components();
        assert_eq!(components.len(), 2);
        assert_eq!(ids(&components[0].nodes), vec!["a", "b"]);
        assert_eq!(components[0].edges.len(), 2);
        assert_eq!(ids(&components[1].nodes), vec!["lonely"]);
        assert!(components[1].edges.is_empty());
    }

    #[test]
    fn square_with_cross_edge_has_one_pair() {
        assert_eq!(
            articulation_pairs(&square(true)),
            vec![("point1".to_string(), "point3".to_string())]
        );
        assert_eq!(articulation_pairs(&square(false)).len(), 2);
    }

    #[test]
    fn splitting_a_point_clones_it_per_component() {
        let graph = ConstraintGraph::new(
            vec![point("a"), point("b"), point("c")],
            vec![distance("e1", "a", "b"), distance("e2", "b", "c")],
        );
        let split = split_at_articulation_point(&graph, "b").expect("split");
        assert_eq!(ids(&split.nodes), vec!["a", "b_0", "c", "b_1"]);
        assert_eq!(split.edges[0], distance("e1", "a", "b_0"));
        assert_eq!(split.edges[1], distance("e2", "b_1", "c"));
        // The input graph is untouched.
        assert_eq!(ids(&graph.nodes), vec!["a", "b", "c"]);
    }

    #[test]
    fn square_with_cross_edge_splits_into_linked_triangles() {
        let result = decompose(&square(true)).expect("decompose");
        assert_eq!(result.steps, 1);

        let components = result.graph.components();
        assert_eq!(components.len(), 2);
        for component in &components {
            assert_eq!(component.nodes.len(), 3);
            assert_eq!(component.edges.len(), 3);
            assert!(articulation_points(component).is_empty());
        }

        let links: Vec<&Edge> = result
            .graph
            .edges
            .iter()
            .filter(|e| e.id.contains("virtual_edge"))
            .collect();
        assert_eq!(
            links,
            vec![
                &distance("point3_virtual_edge_0", "point1_0", "point3_0"),
                &distance("point3_virtual_edge_1", "point1_1", "point3_1"),
            ]
        );
    }

    #[test]
    fn plain_square_gets_virtual_links() {
        let result = decompose(&square(false)).expect("decompose");
        assert_eq!(result.steps, 1);
        let virtual_edges: Vec<_> = result
            .graph
            .edges
            .iter()
            .filter(|e| e.kind == EdgeKind::Virtual)
            .map(|e| (e.source.as_str(), e.target.as_str()))
            .collect();
        assert_eq!(
            virtual_edges,
            vec![("point1_0", "point3_0"), ("point1_1", "point3_1")]
        );
    }

    #[test]
    fn decomposing_without_pairs_is_identity() {
        let triangle = ConstraintGraph::new(
            vec![point("a"), point("b"), point("c")],
            vec![
                distance("e1", "a", "b"),
                distance("e2", "b", "c"),
                distance("e3", "c", "a"),
            ],
        );
        let result = decompose(&triangle).expect("decompose");
        assert_eq!(result.steps, 0);
        assert_eq!(result.graph, triangle);
        assert_eq!(split_first_articulation_pair(&triangle).expect("step"), triangle);
    }

    #[test]
    fn zou_graph_decomposes_into_triangles() {
        let graph = zou();
        assert!(articulation_points(&graph).is_empty());
        assert_eq!(articulation_pairs(&graph).len(), 3);

        let result = decompose(&graph).expect("decompose");
        assert_eq!(result.steps, 5);
        let components = result.graph.components();
        assert_eq!(components.len(), 6);
        for component in &components {
            assert_eq!(component.nodes.len(), 3);
            assert!(articulation_points(component).is_empty());
        }
        assert!(articulation_pairs(&result.graph).is_empty());
    }

    #[test]
    fn step_cap_reports_incomplete() {
        let err = decompose_with_limit(&zou(), 2).expect_err("cap");
        match err {
            DecomposeError::Incomplete { steps, graph } => {
                assert_eq!(steps, 2);
                assert!(!articulation_pairs(&graph).is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unknown_pivots_are_errors() {
        let err = split_at_articulation_point(&square(false), "nope").expect_err("unknown");
        assert_eq!(err, DecomposeError::UnknownNode("nope".to_string()));
    }

    #[test]
    fn graph_json_uses_type_field() {
        let json = r#"{
            "nodes": [{"id": "p", "type": "point"}, {"id": "l", "type": "line"}],
            "edges": [{"id": "e", "type": "connection", "source": "l", "target": "p"}]
        }"#;
        let graph: ConstraintGraph = serde_json::from_str(json).expect("json");
        assert_eq!(graph.nodes[1], line("l"));
        assert_eq!(graph.edges[0].kind, EdgeKind::Connection);

        let back = serde_json::to_value(&graph).expect("serialize");
        assert_eq!(back["edges"][0]["type"], "connection");
    }
}
