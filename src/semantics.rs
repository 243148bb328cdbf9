use crate::expr::{ExprTree, NodeKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Semantic dimension of a series. `Unknown` acts as a wildcard in rule
/// matching so untyped columns never block the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SemanticType {
    Price,
    Volume,
    Return,
    Ratio,
    Volatility,
    Indicator,
    Boolean,
    Unknown,
}

/// One typing rule for an operator
#[derive(Debug, Clone, PartialEq)]
pub struct TypeRule {
    pub left: SemanticType,
    pub right: SemanticType,
    pub output: SemanticType,
    pub commutative: bool,
}

impl TypeRule {
    fn new(left: SemanticType, right: SemanticType, output: SemanticType, commutative: bool) -> Self {
        TypeRule {
            left,
            right,
            output,
            commutative,
        }
    }
}

/// Immutable operator rule table plus a column name -> type map.
/// Constructed once and shared by reference, never mutated afterwards.
#[derive(Debug, Clone)]
pub struct TypeSystem {
    rules: HashMap<String, Vec<TypeRule>>,
    columns: HashMap<String, SemanticType>,
}

fn matches(pattern: SemanticType, actual: SemanticType) -> bool {
    pattern == SemanticType::Unknown || actual == SemanticType::Unknown || pattern == actual
}

impl Default for TypeSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeSystem {
    /// Build the default rule table and market column types
    pub fn new() -> TypeSystem {
        use SemanticType::*;

        let mut rules: HashMap<String, Vec<TypeRule>> = HashMap::new();

        // additive operators keep the dimension of their operands
        for op in ["+", "-"] {
            rules.insert(
                op.to_string(),
                vec![
                    TypeRule::new(Price, Price, Price, true),
                    TypeRule::new(Volume, Volume, Volume, true),
                    TypeRule::new(Return, Return, Return, true),
                    TypeRule::new(Ratio, Ratio, Ratio, true),
                    TypeRule::new(Volatility, Volatility, Volatility, true),
                    TypeRule::new(Indicator, Indicator, Indicator, true),
                ],
            );
        }

        rules.insert(
            "*".to_string(),
            vec![
                TypeRule::new(Price, Ratio, Price, true),
                TypeRule::new(Volume, Ratio, Volume, true),
                TypeRule::new(Return, Ratio, Return, true),
                TypeRule::new(Ratio, Ratio, Ratio, true),
                TypeRule::new(Volatility, Ratio, Volatility, true),
                TypeRule::new(Indicator, Ratio, Indicator, true),
                TypeRule::new(Price, Volume, Indicator, true),
                TypeRule::new(Return, Return, Indicator, true),
            ],
        );

        rules.insert(
            "/".to_string(),
            vec![
                TypeRule::new(Price, Price, Ratio, false),
                TypeRule::new(Volume, Volume, Ratio, false),
                TypeRule::new(Return, Return, Ratio, false),
                TypeRule::new(Ratio, Ratio, Ratio, false),
                TypeRule::new(Volatility, Volatility, Ratio, false),
                TypeRule::new(Indicator, Indicator, Ratio, false),
                TypeRule::new(Price, Ratio, Price, false),
                TypeRule::new(Volume, Ratio, Volume, false),
                TypeRule::new(Return, Volatility, Indicator, false),
                TypeRule::new(Price, Volume, Indicator, false),
            ],
        );

        let mut columns = HashMap::new();
        for name in ["open", "high", "low", "close", "vwap"] {
            columns.insert(name.to_string(), Price);
        }
        columns.insert("volume".to_string(), Volume);
        columns.insert("amount".to_string(), Indicator);
        for name in ["ret", "returns", "log_ret"] {
            columns.insert(name.to_string(), Return);
        }

        TypeSystem { rules, columns }
    }

    /// Override or extend the column -> type map (construction time only)
    pub fn with_columns(mut self, overrides: &HashMap<String, SemanticType>) -> TypeSystem {
        for (name, t) in overrides {
            self.columns.insert(name.clone(), *t);
        }
        self
    }

    pub fn column_type(&self, name: &str) -> SemanticType {
        *self
            .columns
            .get(name)
            .unwrap_or(&SemanticType::Unknown)
    }

    /// Output type of `op` applied to (left, right): first matching rule wins,
    /// commutative rules also match the swapped pair. None means invalid.
    pub fn infer_operation_type(
        &self,
        op: &str,
        left: SemanticType,
        right: SemanticType,
    ) -> Option<SemanticType> {
        let rules = self.rules.get(op)?;
        for rule in rules {
            if matches(rule.left, left) && matches(rule.right, right) {
                return Some(rule.output);
            }
            if rule.commutative && matches(rule.left, right) && matches(rule.right, left) {
                return Some(rule.output);
            }
        }
        None
    }

    pub fn is_valid_operation(&self, op: &str, left: SemanticType, right: SemanticType) -> bool {
        self.infer_operation_type(op, left, right).is_some()
    }

    /// Diagnostic for an invalid pair. Additive operators on differing types
    /// default to a dimensional-mismatch message.
    pub fn get_invalid_reason(&self, op: &str, left: SemanticType, right: SemanticType) -> String {
        use SemanticType::*;

        if left == Boolean || right == Boolean {
            return format!("boolean series cannot enter arithmetic '{}'", op);
        }
        match (op, left, right) {
            ("+", Price, Volume) | ("+", Volume, Price) | ("-", Price, Volume) | ("-", Volume, Price) => {
                format!(
                    "dimensional mismatch: cannot {} price and volume series directly",
                    if op == "+" { "add" } else { "subtract" }
                )
            }
            ("/", Volume, Price) => {
                "inverted-unit division: volume / price yields shares-per-currency".to_string()
            }
            ("+", l, r) | ("-", l, r) if l != r => {
                format!("dimensional mismatch: '{}' over {:?} and {:?}", op, l, r)
            }
            _ => format!("no typing rule for '{}' over {:?} and {:?}", op, left, right),
        }
    }

    /// Infer the semantic type of a whole subtree, bottom-up
    pub fn infer_tree_type(&self, tree: &ExprTree, idx: usize) -> SemanticType {
        let node = &tree.nodes[idx];
        match &node.kind {
            NodeKind::Column(name) => self.column_type(name),
            NodeKind::Constant(_) => SemanticType::Ratio,
            NodeKind::Binary(op) => {
                if node.children.len() != 2 {
                    return SemanticType::Unknown;
                }
                let left = self.infer_tree_type(tree, node.children[0]);
                let right = self.infer_tree_type(tree, node.children[1]);
                self.infer_operation_type(op, left, right)
                    .unwrap_or(SemanticType::Unknown)
            }
            NodeKind::Unary(name) => {
                let inner = node
                    .children
                    .first()
                    .map(|&c| self.infer_tree_type(tree, c))
                    .unwrap_or(SemanticType::Unknown);
                match name.as_str() {
                    "abs" | "neg" => inner,
                    "sign" => SemanticType::Indicator,
                    _ => SemanticType::Indicator,
                }
            }
            NodeKind::Call(_) => SemanticType::Unknown,
        }
    }
}

/// Layered semantic validator. Named rules are checked on top of bare type
/// validity; every violation is collected, nothing short-circuits.
pub struct SemanticValidator {
    types: TypeSystem,
}

impl SemanticValidator {
    pub fn new(types: TypeSystem) -> SemanticValidator {
        SemanticValidator { types }
    }

    pub fn types(&self) -> &TypeSystem {
        &self.types
    }

    /// All violated rule descriptions for the tree, empty when clean
    pub fn validate(&self, tree: &ExprTree) -> Vec<String> {
        let mut violations = Vec::new();
        for idx in tree.flatten() {
            let node = &tree.nodes[idx];
            let op = match &node.kind {
                NodeKind::Binary(op) if node.children.len() == 2 => op,
                _ => continue,
            };
            let left = self.types.infer_tree_type(tree, node.children[0]);
            let right = self.types.infer_tree_type(tree, node.children[1]);
            self.check_operation(op, left, right, &mut violations);
        }
        violations
    }

    fn check_operation(
        &self,
        op: &str,
        left: SemanticType,
        right: SemanticType,
        violations: &mut Vec<String>,
    ) {
        use SemanticType::*;

        let additive = op == "+" || op == "-";
        let pair_is = |a: SemanticType, b: SemanticType| {
            (left == a && right == b) || (left == b && right == a)
        };

        if additive && pair_is(Price, Volume) {
            violations.push(
                "no price/volume mixing: price and volume series cannot be added or subtracted"
                    .to_string(),
            );
        }
        if op == "/" && left == Volume && right == Price {
            violations.push(
                "no inverted-unit division: divide price by volume, not volume by price"
                    .to_string(),
            );
        }
        if left == Boolean || right == Boolean {
            violations.push(format!(
                "no boolean arithmetic: '{}' applied to a boolean series",
                op
            ));
        }
        if !self.types.is_valid_operation(op, left, right) {
            violations.push(self.types.get_invalid_reason(op, left, right));
        }
    }

    /// Proposed repair for known anti-patterns
    pub fn suggest_fix(&self, op: &str, left: SemanticType, right: SemanticType) -> String {
        use SemanticType::*;

        let pair_is = |a: SemanticType, b: SemanticType| {
            (left == a && right == b) || (left == b && right == a)
        };

        if (op == "+" || op == "-") && pair_is(Price, Volume) {
            return "replace the additive operator with '*' or normalize each side by its mean first".to_string();
        }
        if op == "/" && left == Volume && right == Price {
            return "swap the operands: price / volume keeps conventional units".to_string();
        }
        if left == Boolean || right == Boolean {
            return "route the boolean through a conditional selector instead of arithmetic".to_string();
        }
        "no suggestion".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse;
    use SemanticType::*;

    #[test]
    fn test_price_plus_volume_is_invalid_with_diagnostic() {
        let ts = TypeSystem::new();
        assert!(!ts.is_valid_operation("+", Price, Volume));
        let reason = ts.get_invalid_reason("+", Price, Volume);
        assert!(
            reason.contains("dimensional mismatch"),
            "diagnostic should name a dimensional mismatch, got: {}",
            reason
        );
    }

    #[test]
    fn test_same_dimension_addition_is_valid() {
        let ts = TypeSystem::new();
        assert_eq!(ts.infer_operation_type("+", Price, Price), Some(Price));
        assert_eq!(ts.infer_operation_type("-", Volume, Volume), Some(Volume));
    }

    #[test]
    fn test_unknown_is_a_wildcard() {
        let ts = TypeSystem::new();
        assert_eq!(ts.infer_operation_type("+", Unknown, Price), Some(Price));
        assert_eq!(ts.infer_operation_type("*", Unknown, Unknown), Some(Price));
    }

    #[test]
    fn test_commutative_rules_match_swapped_pair() {
        let ts = TypeSystem::new();
        // (Price, Ratio) -> Price is commutative
        assert_eq!(ts.infer_operation_type("*", Ratio, Price), Some(Price));
        // division rules are not
        assert_eq!(ts.infer_operation_type("/", Price, Price), Some(Ratio));
        assert!(ts.infer_operation_type("/", Ratio, Volume).is_none());
    }

    #[test]
    fn test_validator_collects_all_violations() {
        // both halves are broken: price+volume on the left, volume/price
        // on the right; the validator must report both
        let validator = SemanticValidator::new(TypeSystem::new());
        let tree = parse("((close + volume) * (volume / close))");
        let violations = validator.validate(&tree);
        assert!(violations.iter().any(|v| v.contains("price/volume mixing")));
        assert!(violations.iter().any(|v| v.contains("inverted-unit")));
        assert!(violations.len() >= 2);
    }

    #[test]
    fn test_validator_passes_clean_tree() {
        let validator = SemanticValidator::new(TypeSystem::new());
        let tree = parse("((close - open) / close)");
        assert!(validator.validate(&tree).is_empty());
    }

    #[test]
    fn test_tree_type_inference() {
        let ts = TypeSystem::new();
        let tree = parse("((close - open) / close)");
        assert_eq!(ts.infer_tree_type(&tree, tree.root), Ratio);

        let tree = parse("(close * 2)");
        assert_eq!(ts.infer_tree_type(&tree, tree.root), Price);
    }

    #[test]
    fn test_suggest_fix_known_antipatterns() {
        let validator = SemanticValidator::new(TypeSystem::new());
        assert!(validator.suggest_fix("+", Price, Volume).contains("normalize"));
        assert!(validator.suggest_fix("/", Volume, Price).contains("swap"));
        assert_eq!(validator.suggest_fix("+", Price, Price), "no suggestion");
    }

    #[test]
    fn test_with_columns_overrides_reach_validation() {
        let mut overrides = HashMap::new();
        overrides.insert("turnover".to_string(), Volume);
        let ts = TypeSystem::new().with_columns(&overrides);
        assert_eq!(ts.column_type("turnover"), Volume);
        // unknown columns stay wildcards
        assert_eq!(ts.column_type("mystery"), Unknown);

        let validator = SemanticValidator::new(ts);
        let tree = parse("(close + turnover)");
        assert!(validator
            .validate(&tree)
            .iter()
            .any(|v| v.contains("price/volume")));
    }

    #[test]
    fn test_boolean_arithmetic_rejected() {
        let ts = TypeSystem::new();
        assert!(!ts.is_valid_operation("+", Boolean, Price));
        assert!(ts.get_invalid_reason("+", Boolean, Price).contains("boolean"));
    }
}
