//! Lowering of expression trees into an arena of binary operations.

use serde::Serialize;

use super::parser::{Expr, Factor, Sign};
use crate::tasks::model::{ArithmeticError, Operand, Operator, SubtaskId};

/// One binary operation. Operands refer to earlier nodes only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Node {
    pub operator: Operator,
    pub left: Operand,
    pub right: Operand,
}

/// Operation graph for one expression.
///
/// Nodes are stored in post-order, so every reference points at a lower
/// index and the root (when the expression is not a bare literal) is the
/// last node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dag {
    nodes: Vec<Node>,
    root: Operand,
}

impl Dag {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn into_nodes(self) -> Vec<Node> {
        self.nodes
    }

    pub fn root(&self) -> Operand {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Evaluate in topological order.
    pub fn evaluate(&self) -> Result<f64, ArithmeticError> {
        let mut values: Vec<f64> = Vec::with_capacity(self.nodes.len());
        let resolve = |operand: Operand, values: &[f64]| match operand {
            Operand::Literal(v) => v,
            Operand::Subtask(id) => values[id as usize],
        };
        for node in &self.nodes {
            let left = resolve(node.left, &values);
            let right = resolve(node.right, &values);
            values.push(node.operator.apply(left, right)?);
        }
        Ok(resolve(self.root, &values))
    }

    /// Nodes with no subtask operands.
    pub fn leaves(&self) -> impl Iterator<Item = SubtaskId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| {
                matches!(n.left, Operand::Literal(_)) && matches!(n.right, Operand::Literal(_))
            })
            .map(|(i, _)| i as SubtaskId)
    }
}

/// Lower a parsed expression.
///
/// Runs of `+`/`-` (and of `*` alone) are grouped as balanced trees so
/// independent pairs can run on different workers: `1+2+3+4` becomes
/// `(1+2)+(3+4)`. A group that follows `-` has its inner signs flipped to
/// keep the value: `a-b+c` becomes `a-(b-c)`. Chains containing `/` stay
/// left-associative since regrouping them can introduce divisions by zero.
///
/// The regrouping is exact over the reals but not over `f64`: each group
/// rounds on its own, so a result can differ from a left-to-right fold once
/// magnitudes exceed 2^53. `1e20-1e20+1` lowers to `1e20-(1e20-1)` and
/// evaluates to `0`, not `1`. Integer arithmetic within that range is
/// unaffected.
pub(super) fn lower(expr: &Expr) -> Dag {
    let mut builder = Builder { nodes: Vec::new() };
    let root = builder.lower(expr);
    Dag {
        nodes: builder.nodes,
        root,
    }
}

struct Builder {
    nodes: Vec<Node>,
}

impl Builder {
    fn push(&mut self, operator: Operator, left: Operand, right: Operand) -> Operand {
        let id = self.nodes.len() as SubtaskId;
        self.nodes.push(Node {
            operator,
            left,
            right,
        });
        Operand::Subtask(id)
    }

    fn lower(&mut self, expr: &Expr) -> Operand {
        match expr {
            Expr::Number(value) => Operand::Literal(*value),
            Expr::Negate(inner) => match self.lower(inner) {
                Operand::Literal(value) => Operand::Literal(-value),
                operand => self.push(Operator::Subtract, Operand::Literal(0.0), operand),
            },
            Expr::Sum(terms) => {
                let terms: Vec<(Sign, &Expr)> = terms.iter().map(|(s, e)| (*s, e)).collect();
                self.sum(&terms)
            }
            Expr::Product(factors) if factors.iter().all(|(op, _)| *op == Factor::Mul) => {
                let factors: Vec<&Expr> = factors.iter().map(|(_, e)| e).collect();
                self.product(&factors)
            }
            Expr::Product(factors) => {
                let mut iter = factors.iter();
                let mut acc = match iter.next() {
                    Some((_, first)) => self.lower(first),
                    None => Operand::Literal(1.0),
                };
                for (op, expr) in iter {
                    let right = self.lower(expr);
                    let operator = match op {
                        Factor::Mul => Operator::Multiply,
                        Factor::Div => Operator::Divide,
                    };
                    acc = self.push(operator, acc, right);
                }
                acc
            }
        }
    }

    /// The first term's sign is treated as `Plus`.
    fn sum(&mut self, terms: &[(Sign, &Expr)]) -> Operand {
        match terms {
            [] => Operand::Literal(0.0),
            [(_, only)] => self.lower(only),
            _ => {
                let mid = terms.len() / 2;
                let left = self.sum(&terms[..mid]);
                let joint = terms[mid].0;
                let right_terms: Vec<(Sign, &Expr)> = terms[mid..]
                    .iter()
                    .map(|(sign, e)| match (joint, sign) {
                        (Sign::Minus, Sign::Minus) => (Sign::Plus, *e),
                        (Sign::Minus, Sign::Plus) => (Sign::Minus, *e),
                        (Sign::Plus, sign) => (*sign, *e),
                    })
                    .collect();
                let right = self.sum(&right_terms);
                let operator = match joint {
                    Sign::Plus => Operator::Add,
                    Sign::Minus => Operator::Subtract,
                };
                self.push(operator, left, right)
            }
        }
    }

    fn product(&mut self, factors: &[&Expr]) -> Operand {
        match factors {
            [] => Operand::Literal(1.0),
            [only] => self.lower(only),
            _ => {
                let mid = factors.len() / 2;
                let left = self.product(&factors[..mid]);
                let right = self.product(&factors[mid..]);
                self.push(Operator::Multiply, left, right)
            }
        }
    }
}
