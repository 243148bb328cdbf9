use log::debug;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// Binary operators recognized at bracket depth 0 by the parser
pub const BINARY_OPS: [char; 4] = ['+', '-', '*', '/'];

/// Single-argument calls promoted to unary nodes
pub const UNARY_OPS: [&str; 5] = ["abs", "log", "sqrt", "sign", "neg"];

/// Kind of an expression node. The enum is closed on purpose: every consumer
/// matches exhaustively, so a new kind is a compile-time failure everywhere.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Reference to a named data column
    Column(String),
    /// Numeric literal
    Constant(f64),
    /// Binary operator, arity 2
    Binary(String),
    /// Unary operator, arity 1
    Unary(String),
    /// Function call, arity >= 1
    Call(String),
}

/// One node of the arena. The parent back-reference is an index, not a
/// pointer, so cloning the whole arena clones the tree with no aliasing.
#[derive(Debug, Clone, PartialEq)]
pub struct ExprNode {
    pub kind: NodeKind,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

/// Index-addressed expression tree
#[derive(Debug, Clone, PartialEq)]
pub struct ExprTree {
    pub nodes: Vec<ExprNode>,
    pub root: usize,
}

impl ExprTree {
    fn push(&mut self, kind: NodeKind, parent: Option<usize>, children: Vec<usize>) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(ExprNode {
            kind,
            parent,
            children,
        });
        idx
    }

    /// Indices of the nodes reachable from the root, preorder
    pub fn flatten(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(idx) = stack.pop() {
            out.push(idx);
            for &child in self.nodes[idx].children.iter().rev() {
                stack.push(child);
            }
        }
        out
    }

    /// Number of reachable nodes
    pub fn size(&self) -> usize {
        self.flatten().len()
    }

    /// Depth of the tree, a lone leaf having depth 1
    pub fn depth(&self) -> usize {
        self.depth_of(self.root)
    }

    fn depth_of(&self, idx: usize) -> usize {
        1 + self.nodes[idx]
            .children
            .iter()
            .map(|&c| self.depth_of(c))
            .max()
            .unwrap_or(0)
    }

    /// Number of operator nodes (binary, unary and calls)
    pub fn operator_count(&self) -> usize {
        self.flatten()
            .iter()
            .filter(|&&i| {
                matches!(
                    self.nodes[i].kind,
                    NodeKind::Binary(_) | NodeKind::Unary(_) | NodeKind::Call(_)
                )
            })
            .count()
    }

    /// Number of constant leaves
    pub fn parameter_count(&self) -> usize {
        self.flatten()
            .iter()
            .filter(|&&i| matches!(self.nodes[i].kind, NodeKind::Constant(_)))
            .count()
    }

    /// Drop unreachable nodes and renumber indices in preorder
    pub fn compact(&mut self) {
        let order = self.flatten();
        let mut remap = vec![usize::MAX; self.nodes.len()];
        for (new_idx, &old_idx) in order.iter().enumerate() {
            remap[old_idx] = new_idx;
        }
        let mut nodes = Vec::with_capacity(order.len());
        for &old_idx in &order {
            let node = &self.nodes[old_idx];
            nodes.push(ExprNode {
                kind: node.kind.clone(),
                parent: node.parent.map(|p| remap[p]),
                children: node.children.iter().map(|&c| remap[c]).collect(),
            });
        }
        self.root = remap[self.root];
        self.nodes = nodes;
    }

    fn copy_subtree_from(&mut self, donor: &ExprTree, donor_idx: usize, parent: Option<usize>) -> usize {
        let idx = self.push(donor.nodes[donor_idx].kind.clone(), parent, Vec::new());
        let children: Vec<usize> = donor.nodes[donor_idx]
            .children
            .iter()
            .map(|&c| self.copy_subtree_from(donor, c, Some(idx)))
            .collect();
        self.nodes[idx].children = children;
        idx
    }

    /// Replace the subtree rooted at `at` with a copy of the donor subtree
    /// rooted at `donor_idx`. Replacing the root swaps the whole tree.
    pub fn replace_subtree(&mut self, at: usize, donor: &ExprTree, donor_idx: usize) {
        let parent = self.nodes[at].parent;
        let new_idx = self.copy_subtree_from(donor, donor_idx, parent);
        match parent {
            Some(p) => {
                for slot in self.nodes[p].children.iter_mut() {
                    if *slot == at {
                        *slot = new_idx;
                        break;
                    }
                }
            }
            None => self.root = new_idx,
        }
        self.compact();
    }

    /// Wrap the node at `idx` inside a unary call
    pub fn wrap_node(&mut self, idx: usize, name: &str) {
        let parent = self.nodes[idx].parent;
        let wrapper = self.push(NodeKind::Unary(name.to_string()), parent, vec![idx]);
        self.nodes[idx].parent = Some(wrapper);
        match parent {
            Some(p) => {
                for slot in self.nodes[p].children.iter_mut() {
                    if *slot == idx {
                        *slot = wrapper;
                        break;
                    }
                }
            }
            None => self.root = wrapper,
        }
    }

    /// Collapse the node at `idx` to its `keep`-th child
    pub fn hoist_child(&mut self, idx: usize, keep: usize) {
        let child = self.nodes[idx].children[keep];
        let parent = self.nodes[idx].parent;
        self.nodes[child].parent = parent;
        match parent {
            Some(p) => {
                for slot in self.nodes[p].children.iter_mut() {
                    if *slot == idx {
                        *slot = child;
                        break;
                    }
                }
            }
            None => self.root = child,
        }
        self.compact();
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Position of the first binary operator at bracket depth 0, skipping a
/// leading sign so "-3" never splits into an empty left side
fn find_top_level_operator(text: &str) -> Option<(usize, char)> {
    let mut depth: i32 = 0;
    for (pos, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ if depth == 0 && pos > 0 && BINARY_OPS.contains(&c) => return Some((pos, c)),
            _ => {}
        }
    }
    None
}

/// Split a call argument list on depth-0 commas
fn split_arguments(text: &str) -> Vec<&str> {
    let mut args = Vec::new();
    let mut depth: i32 = 0;
    let mut start = 0;
    for (pos, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                args.push(&text[start..pos]);
                start = pos + 1;
            }
            _ => {}
        }
    }
    args.push(&text[start..]);
    args
}

fn parse_into(text: &str, tree: &mut ExprTree) -> usize {
    let text = text.trim();

    if is_identifier(text) {
        return tree.push(NodeKind::Column(text.to_string()), None, Vec::new());
    }

    if let Ok(value) = text.parse::<f64>() {
        return tree.push(NodeKind::Constant(value), None, Vec::new());
    }

    // Parenthesized binary expression: (L op R)
    if text.starts_with('(') && text.ends_with(')') && text.len() > 2 {
        let inner = &text[1..text.len() - 1];
        if let Some((pos, op)) = find_top_level_operator(inner) {
            let left = parse_into(&inner[..pos], tree);
            let right = parse_into(&inner[pos + 1..], tree);
            let node = tree.push(
                NodeKind::Binary(op.to_string()),
                None,
                vec![left, right],
            );
            tree.nodes[left].parent = Some(node);
            tree.nodes[right].parent = Some(node);
            return node;
        }
    }

    // Function call: name(arg, ...) with nested-parenthesis-aware splitting
    if text.ends_with(')') {
        if let Some(open) = text.find('(') {
            let name = &text[..open];
            if open > 0 && is_identifier(name) {
                let inner = &text[open + 1..text.len() - 1];
                if !inner.trim().is_empty() {
                    let raw_args = split_arguments(inner);
                    if raw_args.iter().all(|a| !a.trim().is_empty()) {
                        let children: Vec<usize> =
                            raw_args.iter().map(|a| parse_into(a, tree)).collect();
                        let kind = if children.len() == 1 && UNARY_OPS.contains(&name) {
                            NodeKind::Unary(name.to_string())
                        } else {
                            NodeKind::Call(name.to_string())
                        };
                        let node = tree.push(kind, None, children.clone());
                        for child in children {
                            tree.nodes[child].parent = Some(node);
                        }
                        return node;
                    }
                }
            }
        }
    }

    // Deliberate fallback: anything unrecognized becomes a column leaf.
    // Intent is undocumented upstream; behavior is pinned by tests.
    debug!("unrecognized expression fragment treated as column: {:?}", text);
    tree.push(NodeKind::Column(text.to_string()), None, Vec::new())
}

/// Parse expression text into a tree. Never fails: unrecognized text
/// degrades to a column leaf.
pub fn parse(text: &str) -> ExprTree {
    let mut tree = ExprTree {
        nodes: Vec::new(),
        root: 0,
    };
    let root = parse_into(text, &mut tree);
    tree.root = root;
    tree
}

fn format_node(tree: &ExprTree, idx: usize) -> Result<String, String> {
    let node = &tree.nodes[idx];
    match &node.kind {
        NodeKind::Column(name) => Ok(name.clone()),
        NodeKind::Constant(value) => Ok(format!("{}", value)),
        NodeKind::Binary(op) => {
            if node.children.len() != 2 {
                return Err(format!(
                    "corrupted tree: binary operator '{}' has {} children",
                    op,
                    node.children.len()
                ));
            }
            let left = format_node(tree, node.children[0])?;
            let right = format_node(tree, node.children[1])?;
            Ok(format!("({} {} {})", left, op, right))
        }
        NodeKind::Unary(name) => {
            if node.children.len() != 1 {
                return Err(format!(
                    "corrupted tree: unary operator '{}' has {} children",
                    name,
                    node.children.len()
                ));
            }
            let child = format_node(tree, node.children[0])?;
            Ok(format!("{}({})", name, child))
        }
        NodeKind::Call(name) => {
            if node.children.is_empty() {
                return Err(format!("corrupted tree: call '{}' has no arguments", name));
            }
            let args: Result<Vec<String>, String> = node
                .children
                .iter()
                .map(|&c| format_node(tree, c))
                .collect();
            Ok(format!("{}({})", name, args?.join(", ")))
        }
    }
}

/// Print a tree back to expression text. Structural inverse of `parse`;
/// the only hard error is an arity-invariant violation.
pub fn to_expression(tree: &ExprTree) -> Result<String, String> {
    format_node(tree, tree.root)
}

/// Subtree crossover: clone parent 1, splice in a random subtree cloned from
/// parent 2. Exactly one child, neither parent is touched.
pub fn subtree_crossover(p1: &ExprTree, p2: &ExprTree, rng: &mut ChaCha8Rng) -> ExprTree {
    let mut child = p1.clone();
    let sites = child.flatten();
    let donors = p2.flatten();
    if sites.is_empty() || donors.is_empty() {
        return child;
    }
    let at = sites[rng.gen_range(0..sites.len())];
    let donor_idx = donors[rng.gen_range(0..donors.len())];
    child.replace_subtree(at, p2, donor_idx);
    child
}

/// Grow a random tree over the given columns, depth-bounded
pub fn random_tree(
    columns: &[String],
    max_depth: usize,
    max_param_value: f64,
    rng: &mut ChaCha8Rng,
) -> ExprTree {
    let mut tree = ExprTree {
        nodes: Vec::new(),
        root: 0,
    };
    let root = grow(columns, max_depth.max(1), max_param_value, rng, &mut tree);
    tree.root = root;
    tree
}

fn grow(
    columns: &[String],
    budget: usize,
    max_param_value: f64,
    rng: &mut ChaCha8Rng,
    tree: &mut ExprTree,
) -> usize {
    if budget <= 1 || rng.gen_bool(0.3) {
        // leaf: columns dominate, constants stay small and positive
        if !columns.is_empty() && rng.gen_bool(0.7) {
            let name = columns[rng.gen_range(0..columns.len())].clone();
            return tree.push(NodeKind::Column(name), None, Vec::new());
        }
        let value = (rng.gen_range(0.5..max_param_value.max(1.0)) * 100.0).round() / 100.0;
        return tree.push(NodeKind::Constant(value), None, Vec::new());
    }

    if rng.gen_bool(0.7) {
        let op = BINARY_OPS[rng.gen_range(0..BINARY_OPS.len())];
        let left = grow(columns, budget - 1, max_param_value, rng, tree);
        let right = grow(columns, budget - 1, max_param_value, rng, tree);
        let node = tree.push(NodeKind::Binary(op.to_string()), None, vec![left, right]);
        tree.nodes[left].parent = Some(node);
        tree.nodes[right].parent = Some(node);
        node
    } else {
        let name = UNARY_OPS[rng.gen_range(0..UNARY_OPS.len())];
        let child = grow(columns, budget - 1, max_param_value, rng, tree);
        let node = tree.push(NodeKind::Unary(name.to_string()), None, vec![child]);
        tree.nodes[child].parent = Some(node);
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_parse_column() {
        let tree = parse("close");
        assert_eq!(tree.size(), 1);
        assert_eq!(tree.nodes[tree.root].kind, NodeKind::Column("close".to_string()));
    }

    #[test]
    fn test_parse_constant() {
        let tree = parse("-2.5");
        assert_eq!(tree.nodes[tree.root].kind, NodeKind::Constant(-2.5));
    }

    #[test]
    fn test_parse_binary() {
        let tree = parse("(close + volume)");
        assert_eq!(tree.size(), 3);
        assert_eq!(tree.depth(), 2);
        assert_eq!(
            tree.nodes[tree.root].kind,
            NodeKind::Binary("+".to_string())
        );
    }

    #[test]
    fn test_parse_nested_binary_splits_at_depth_zero() {
        let tree = parse("((close - open) / close)");
        assert_eq!(
            tree.nodes[tree.root].kind,
            NodeKind::Binary("/".to_string())
        );
        assert_eq!(tree.size(), 5);
        assert_eq!(tree.depth(), 3);
    }

    #[test]
    fn test_parse_unary_and_call() {
        let tree = parse("abs(close)");
        assert_eq!(tree.nodes[tree.root].kind, NodeKind::Unary("abs".to_string()));

        let tree = parse("ts_corr(close, volume)");
        assert_eq!(
            tree.nodes[tree.root].kind,
            NodeKind::Call("ts_corr".to_string())
        );
        assert_eq!(tree.nodes[tree.root].children.len(), 2);
    }

    #[test]
    fn test_parse_nested_call_arguments() {
        let tree = parse("ts_corr((high - low), abs(ret))");
        assert_eq!(tree.nodes[tree.root].children.len(), 2);
        assert_eq!(tree.size(), 6);
    }

    #[test]
    fn test_parse_fallback_to_column() {
        // malformed text degrades to a column leaf, never an error
        let tree = parse("close +");
        assert_eq!(tree.size(), 1);
        assert!(matches!(tree.nodes[tree.root].kind, NodeKind::Column(_)));

        let tree = parse("f()");
        assert!(matches!(tree.nodes[tree.root].kind, NodeKind::Column(_)));
    }

    #[test]
    fn test_round_trip_preserves_size_and_depth() {
        for expr in [
            "close",
            "3.5",
            "(close + volume)",
            "((close - open) / close)",
            "abs((close * 2))",
            "ts_corr(close, abs(volume))",
        ] {
            let tree = parse(expr);
            let printed = to_expression(&tree).unwrap();
            let reparsed = parse(&printed);
            assert_eq!(tree.size(), reparsed.size(), "size mismatch for {}", expr);
            assert_eq!(tree.depth(), reparsed.depth(), "depth mismatch for {}", expr);
        }
    }

    #[test]
    fn test_round_trip_fixed_point() {
        let printed = to_expression(&parse("(close + volume)")).unwrap();
        assert_eq!(printed, "(close + volume)");
        assert_eq!(to_expression(&parse(&printed)).unwrap(), printed);
    }

    #[test]
    fn test_to_expression_rejects_bad_arity() {
        let mut tree = parse("(close + volume)");
        tree.nodes[tree.root].children.pop();
        assert!(to_expression(&tree).is_err());
    }

    #[test]
    fn test_replace_subtree_at_root() {
        let mut tree = parse("(close + volume)");
        let donor = parse("open");
        tree.replace_subtree(tree.root, &donor, donor.root);
        assert_eq!(to_expression(&tree).unwrap(), "open");
    }

    #[test]
    fn test_replace_subtree_rewires_parent() {
        let mut tree = parse("(close + volume)");
        let donor = parse("(high - low)");
        let leaf = tree.nodes[tree.root].children[1];
        tree.replace_subtree(leaf, &donor, donor.root);
        assert_eq!(to_expression(&tree).unwrap(), "(close + (high - low))");
        // parent back-references stay consistent after compaction
        for idx in tree.flatten() {
            for &child in &tree.nodes[idx].children {
                assert_eq!(tree.nodes[child].parent, Some(idx));
            }
        }
    }

    #[test]
    fn test_wrap_and_hoist() {
        let mut tree = parse("(close + volume)");
        tree.wrap_node(tree.root, "abs");
        assert_eq!(to_expression(&tree).unwrap(), "abs((close + volume))");

        let inner = tree.nodes[tree.root].children[0];
        tree.hoist_child(inner, 0);
        assert_eq!(to_expression(&tree).unwrap(), "abs(close)");
    }

    #[test]
    fn test_crossover_never_mutates_parents() {
        let p1 = parse("(close + volume)");
        let p2 = parse("((high - low) / close)");
        let p1_before = p1.clone();
        let p2_before = p2.clone();

        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..50 {
            let mut child = subtree_crossover(&p1, &p2, &mut rng);
            // mutate the child aggressively, parents must not move
            if let Some(&first) = child.flatten().first() {
                child.nodes[first].kind = NodeKind::Column("poisoned".to_string());
                child.nodes[first].children.clear();
            }
            assert_eq!(p1, p1_before);
            assert_eq!(p2, p2_before);
        }
    }

    #[test]
    fn test_crossover_child_is_well_formed() {
        let p1 = parse("((close - open) * volume)");
        let p2 = parse("abs((high / low))");
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        for _ in 0..100 {
            let child = subtree_crossover(&p1, &p2, &mut rng);
            assert!(to_expression(&child).is_ok());
            assert!(child.size() >= 1);
        }
    }

    #[test]
    fn test_random_tree_respects_depth_bound() {
        let columns = vec!["close".to_string(), "volume".to_string()];
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..50 {
            let tree = random_tree(&columns, 4, 10.0, &mut rng);
            assert!(tree.depth() <= 4);
            assert!(to_expression(&tree).is_ok());
        }
    }
}
