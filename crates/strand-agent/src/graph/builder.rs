use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tracing::debug;

use strand_core::error::{GraphError, Result, StrandError};

use super::edge::{Edge, Route};
use super::node::{Node, NodeKind, NodeValue};
use crate::context::AgentContext;

/// Reserved id of the entry sentinel.
pub const START_NODE_ID: &str = "__start__";
/// Reserved id of the terminal sentinel.
pub const FINISH_NODE_ID: &str = "__finish__";

/// Typed reference to a node added to a `GraphBuilder`.
pub struct NodeHandle<I, O> {
    id: String,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> NodeHandle<I, O> {
    fn new(id: String) -> Self {
        Self {
            id,
            _types: PhantomData,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<I, O> Clone for NodeHandle<I, O> {
    fn clone(&self) -> Self {
        Self::new(self.id.clone())
    }
}

impl<I, O> std::fmt::Debug for NodeHandle<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeHandle({})", self.id)
    }
}

/// Arena storage shared by every clone of a `Graph`.
pub(crate) struct GraphData {
    name: String,
    nodes: HashMap<String, Node>,
    order: Vec<String>,
    edges: HashMap<String, Vec<Edge>>,
}

impl GraphData {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn node(&self, id: &str) -> Result<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| StrandError::Graph(GraphError::UnknownNode(id.to_string())))
    }

    /// Edges leaving `id`, in declaration order.
    pub(crate) fn outgoing(&self, id: &str) -> &[Edge] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// An immutable, validated execution graph from `I` to `O`.
pub struct Graph<I, O> {
    data: Arc<GraphData>,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> Clone for Graph<I, O> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            _types: PhantomData,
        }
    }
}

impl<I, O> Graph<I, O> {
    pub fn name(&self) -> &str {
        &self.data.name
    }

    /// Node ids in the order they were added, sentinels first.
    pub fn node_ids(&self) -> Vec<&str> {
        self.data.order.iter().map(String::as_str).collect()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.data.nodes.get(id)
    }

    pub fn edges_from(&self, id: &str) -> &[Edge] {
        self.data.outgoing(id)
    }

    pub(crate) fn data(&self) -> &Arc<GraphData> {
        &self.data
    }

    /// Nodes and edges in declaration order, for diagnostics.
    pub fn describe(&self) -> GraphDescription {
        let nodes = self
            .data
            .order
            .iter()
            .filter_map(|id| self.data.nodes.get(id))
            .map(|node| NodeDescription {
                id: node.id().to_string(),
                kind: node.kind().clone(),
                input_type: node.input_type(),
                output_type: node.output_type(),
            })
            .collect();
        let edges = self
            .data
            .order
            .iter()
            .flat_map(|id| self.data.outgoing(id))
            .map(|edge| EdgeDescription {
                from: edge.from().to_string(),
                to: edge.to().to_string(),
                label: edge.label().map(str::to_string),
            })
            .collect();
        GraphDescription {
            name: self.data.name.clone(),
            nodes,
            edges,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphDescription {
    pub name: String,
    pub nodes: Vec<NodeDescription>,
    pub edges: Vec<EdgeDescription>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeDescription {
    pub id: String,
    pub kind: NodeKind,
    pub input_type: &'static str,
    pub output_type: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeDescription {
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Declares nodes and edges, then validates them into a `Graph`.
///
/// Start and finish sentinels are created up front. Cycles are allowed;
/// a tool loop routes a tool result back to an earlier LLM node.
pub struct GraphBuilder<I, O> {
    name: String,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    errors: Vec<GraphError>,
    _types: PhantomData<fn(I) -> O>,
}

impl<I: NodeValue, O: NodeValue> GraphBuilder<I, O> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: vec![
                Node::identity::<I>(START_NODE_ID.to_string(), NodeKind::Start),
                Node::identity::<O>(FINISH_NODE_ID.to_string(), NodeKind::Finish),
            ],
            edges: Vec::new(),
            errors: Vec::new(),
            _types: PhantomData,
        }
    }

    pub fn start(&self) -> NodeHandle<I, I> {
        NodeHandle::new(START_NODE_ID.to_string())
    }

    pub fn finish(&self) -> NodeHandle<O, O> {
        NodeHandle::new(FINISH_NODE_ID.to_string())
    }

    /// Add a node of the given kind. Id clashes are reported by `build`.
    pub fn add_node<A, B, F>(&mut self, id: impl Into<String>, kind: NodeKind, op: F) -> NodeHandle<A, B>
    where
        A: NodeValue,
        B: NodeValue,
        F: Fn(A, AgentContext) -> BoxFuture<'static, Result<B>> + Send + Sync + 'static,
    {
        let id = id.into();
        if id == START_NODE_ID || id == FINISH_NODE_ID {
            self.errors.push(GraphError::DuplicateSentinel(id.clone()));
        } else if self.nodes.iter().any(|n| n.id() == id) {
            self.errors.push(GraphError::DuplicateNode(id.clone()));
        } else {
            self.nodes.push(Node::new(id.clone(), kind, op));
        }
        NodeHandle::new(id)
    }

    /// Add a node running an arbitrary async operation.
    pub fn node<A, B, F, Fut>(&mut self, id: impl Into<String>, op: F) -> NodeHandle<A, B>
    where
        A: NodeValue,
        B: NodeValue,
        F: Fn(A, AgentContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<B>> + Send + 'static,
    {
        self.add_node(
            id,
            NodeKind::Transform,
            move |input: A, ctx: AgentContext| -> BoxFuture<'static, Result<B>> { Box::pin(op(input, ctx)) },
        )
    }

    /// Add a node applying a plain function.
    pub fn transform<A, B, F>(&mut self, id: impl Into<String>, f: F) -> NodeHandle<A, B>
    where
        A: NodeValue,
        B: NodeValue,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        self.add_node(
            id,
            NodeKind::Transform,
            move |input: A, _ctx: AgentContext| -> BoxFuture<'static, Result<B>> {
                let output = f(input);
                Box::pin(async move { Ok(output) })
            },
        )
    }

    /// Connect `from` to `to`. Edges are tried in the order they are added.
    pub fn edge<A, B, C, D>(&mut self, from: &NodeHandle<A, B>, to: &NodeHandle<C, D>, route: Route<B, C>)
    where
        B: NodeValue,
        C: NodeValue,
    {
        self.edges
            .push(route.into_edge(from.id.clone(), to.id.clone()));
    }

    /// Unconditional edge forwarding the output unchanged.
    pub fn forward<A, B, C>(&mut self, from: &NodeHandle<A, B>, to: &NodeHandle<B, C>)
    where
        B: NodeValue,
    {
        self.edge(from, to, Route::always());
    }

    pub fn build(self) -> std::result::Result<Graph<I, O>, GraphError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }

        let order: Vec<String> = self.nodes.iter().map(|n| n.id().to_string()).collect();
        let known: HashSet<&str> = order.iter().map(String::as_str).collect();

        for edge in &self.edges {
            for id in [edge.from(), edge.to()] {
                if !known.contains(id) {
                    return Err(GraphError::UnknownNode(id.to_string()));
                }
            }
        }

        if !self.edges.iter().any(|e| e.to() == FINISH_NODE_ID) {
            return Err(GraphError::FinishNotTargeted);
        }

        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            adjacency.entry(edge.from()).or_default().push(edge.to());
        }
        let mut reached: HashSet<&str> = HashSet::from([START_NODE_ID]);
        let mut queue: VecDeque<&str> = VecDeque::from([START_NODE_ID]);
        while let Some(id) = queue.pop_front() {
            for &next in adjacency.get(id).into_iter().flatten() {
                if reached.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        if let Some(unreachable) = order.iter().find(|id| !reached.contains(id.as_str())) {
            return Err(GraphError::UnreachableNode(unreachable.clone()));
        }

        let mut edges: HashMap<String, Vec<Edge>> = HashMap::new();
        for edge in self.edges {
            edges.entry(edge.from().to_string()).or_default().push(edge);
        }
        let nodes = self
            .nodes
            .into_iter()
            .map(|n| (n.id().to_string(), n))
            .collect();

        debug!(graph = %self.name, nodes = order.len(), "Graph built");

        Ok(Graph {
            data: Arc::new(GraphData {
                name: self.name,
                nodes,
                order,
                edges,
            }),
            _types: PhantomData,
        })
    }
}
