use std::io;

use dot2::{label::Text, GraphWalk, Id, Labeller, Style};
use indexmap::{IndexMap, IndexSet};
use raystack_ir::{inst::ContRef, FuncRef, Function, InstId, Module};

/// Continuation ID to continuation function, in discovery order.
pub type ContinuationMap = IndexMap<u32, FuncRef>;

/// Returns the roots of every shader group: kernel entries and every shader
/// that is not itself a continuation.
pub fn root_functions(module: &Module) -> Vec<FuncRef> {
    module
        .iter_functions()
        .filter(|func_ref| {
            module
                .shader_info(*func_ref)
                .is_some_and(|info| info.is_kernel || !info.is_continuation)
        })
        .collect()
}

/// Collects every continuation transitively invoked from `root`.
pub fn continuation_group(module: &Module, root: FuncRef) -> ContinuationMap {
    let mut group = ContinuationMap::default();
    visit(module, root, &mut group);
    group
}

fn visit(module: &Module, func_ref: FuncRef, group: &mut ContinuationMap) {
    for (_, cont) in suspend_points(&module.funcs[func_ref]) {
        // A continuation may suspend into itself.
        if group.insert(cont.id, cont.func).is_none() {
            visit(module, cont.func, group);
        }
    }
}

/// Iterates over the suspension points of `func` in layout order.
pub fn suspend_points(func: &Function) -> impl Iterator<Item = (InstId, ContRef)> + '_ {
    func.layout.iter_block().flat_map(move |block| {
        func.layout
            .iter_inst(block)
            .filter_map(move |inst| Some((inst, func.dfg.inst(inst).suspend_target()?)))
    })
}

/// Root to continuation edges of a module, for visualization.
pub struct ContinuationGraph<'a> {
    module: &'a Module,
    nodes: IndexSet<FuncRef>,
    edges: IndexSet<(FuncRef, FuncRef, u32)>,
}

impl<'a> ContinuationGraph<'a> {
    pub fn build(module: &'a Module) -> Self {
        let mut nodes = IndexSet::new();
        let mut edges = IndexSet::new();

        for root in root_functions(module) {
            nodes.insert(root);
            let group = continuation_group(module, root);
            for func_ref in std::iter::once(root).chain(group.values().copied()) {
                nodes.insert(func_ref);
                for (_, cont) in suspend_points(&module.funcs[func_ref]) {
                    edges.insert((func_ref, cont.func, cont.id));
                }
            }
        }

        Self {
            module,
            nodes,
            edges,
        }
    }

    pub fn edges(&self) -> impl Iterator<Item = (FuncRef, FuncRef)> + '_ {
        self.edges.iter().map(|(from, to, _)| (*from, *to))
    }

    pub fn render_to<W: io::Write>(&self, output: &mut W) -> io::Result<()> {
        dot2::render(self, output).map_err(|err| match err {
            dot2::Error::Io(err) => err,
            _ => io::Error::new(io::ErrorKind::InvalidData, "invalid graphviz id"),
        })
    }
}

impl<'a> Labeller<'a> for ContinuationGraph<'a> {
    type Node = FuncRef;
    type Edge = (FuncRef, FuncRef, u32);
    type Subgraph = ();

    fn graph_id(&self) -> dot2::Result<Id<'a>> {
        Id::new("continuations")
    }

    fn node_id(&self, n: &Self::Node) -> dot2::Result<Id<'a>> {
        Id::new(format!("{n}"))
    }

    fn node_shape(&self, _n: &Self::Node) -> Option<Text<'a>> {
        Some(Text::LabelStr("box".into()))
    }

    fn node_label(&'a self, n: &Self::Node) -> dot2::Result<Text<'a>> {
        let name = self.module.func_name(*n);
        let label = match self.module.shader_info(*n) {
            Some(info) => format!("{} %{name}", info.kind),
            None => format!("%{name}"),
        };
        Ok(Text::LabelStr(label.into()))
    }

    fn edge_label(&self, e: &Self::Edge) -> Text<'a> {
        Text::LabelStr(format!("#{}", e.2).into())
    }

    fn edge_style(&'a self, e: &Self::Edge) -> Style {
        if e.0 == e.1 {
            Style::Dashed
        } else {
            Style::None
        }
    }
}

impl<'a> GraphWalk<'a> for ContinuationGraph<'a> {
    type Node = FuncRef;
    type Edge = (FuncRef, FuncRef, u32);
    type Subgraph = ();

    fn nodes(&self) -> dot2::Nodes<'a, Self::Node> {
        self.nodes.iter().copied().collect::<Vec<_>>().into()
    }

    fn edges(&'a self) -> dot2::Edges<'a, Self::Edge> {
        self.edges.iter().copied().collect::<Vec<_>>().into()
    }

    fn source(&self, edge: &Self::Edge) -> Self::Node {
        edge.0
    }

    fn target(&self, edge: &Self::Edge) -> Self::Node {
        edge.1
    }
}
