//! Expression compiler: infix text to a DAG of binary operations.

mod dag;
mod lexer;
mod parser;

pub use dag::{Dag, Node};
pub use parser::MAX_DEPTH;

use crate::error::CompileError;

/// Compile an infix arithmetic expression.
///
/// Division by a literal zero compiles fine; it fails when the operation runs.
pub fn compile(text: &str) -> Result<Dag, CompileError> {
    let tokens = lexer::tokenize(text)?;
    let expr = parser::Parser::new(&tokens, text.len()).parse()?;
    Ok(dag::lower(&expr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::{ArithmeticError, Operand, Operator};

    fn eval(text: &str) -> f64 {
        compile(text).unwrap().evaluate().unwrap()
    }

    #[test]
    fn regrouped_chains_round_per_group() {
        assert_eq!(eval("1-2+3-4+5"), 3.0);
        assert_eq!(eval("9007199254740991-1+1"), 9007199254740991.0);

        let dag = compile("100000000000000000000-100000000000000000000+1").unwrap();
        assert_eq!(dag.len(), 2);
        assert_eq!(dag.nodes()[0].operator, Operator::Subtract);
        assert_eq!(dag.nodes()[0].right, Operand::Literal(1.0));
        assert_eq!(dag.evaluate().unwrap(), 0.0);
    }

    #[test]
    fn evaluates_with_standard_precedence() {
        assert_eq!(eval("2+3*4"), 14.0);
        assert_eq!(eval("(2+3)*4"), 20.0);
        assert_eq!(eval("10-2-3"), 5.0);
        assert_eq!(eval("10-2+3"), 11.0);
        assert_eq!(eval("1-2-3-4-5"), -13.0);
        assert_eq!(eval("100/10/5"), 2.0);
        assert_eq!(eval("2*3*4*5"), 120.0);
        assert_eq!(eval("8/2*4"), 16.0);
        assert_eq!(eval("-(2+3)*2"), -10.0);
        assert_eq!(eval("2*-3"), -6.0);
        assert_eq!(eval(" 1.5 + 2.25 "), 3.75);
    }

    #[test]
    fn one_subtask_per_operation() {
        let dag = compile("2+3*4").unwrap();
        assert_eq!(dag.len(), 2);
        assert_eq!(dag.nodes()[0].operator, Operator::Multiply);
        assert_eq!(dag.root(), Operand::Subtask(1));
    }

    #[test]
    fn long_sums_are_balanced() {
        let dag = compile("1+2+3+4").unwrap();
        assert_eq!(dag.len(), 3);
        assert_eq!(dag.leaves().count(), 2);
        assert_eq!(
            dag.nodes()[2],
            Node {
                operator: Operator::Add,
                left: Operand::Subtask(0),
                right: Operand::Subtask(1),
            }
        );
    }

    #[test]
    fn references_point_backwards() {
        let dag = compile("((1+2)*(3-4))/(5+6*7)-8").unwrap();
        for (i, node) in dag.nodes().iter().enumerate() {
            for operand in [node.left, node.right] {
                if let Operand::Subtask(id) = operand {
                    assert!((id as usize) < i);
                }
            }
        }
        assert_eq!(dag.root(), Operand::Subtask(dag.len() as u32 - 1));
    }

    #[test]
    fn literal_only_expression_has_no_nodes() {
        let dag = compile("(42)").unwrap();
        assert!(dag.is_empty());
        assert_eq!(dag.root(), Operand::Literal(42.0));
    }

    #[test]
    fn negated_group_subtracts_from_zero() {
        let dag = compile("-(2+3)").unwrap();
        assert_eq!(dag.nodes()[1].operator, Operator::Subtract);
        assert_eq!(dag.nodes()[1].left, Operand::Literal(0.0));
    }

    #[test]
    fn division_by_literal_zero_compiles() {
        let dag = compile("10/0+5").unwrap();
        assert_eq!(dag.evaluate(), Err(ArithmeticError::DivisionByZero));
    }

    #[test]
    fn identical_input_gives_identical_graph() {
        assert_eq!(compile("1+2*3").unwrap(), compile("1+2*3").unwrap());
    }

    #[test]
    fn syntax_errors() {
        for bad in ["", "2+", "(1+2", "1+2)", "2**3", "abc", "1 2"] {
            assert!(compile(bad).is_err(), "{bad:?} should not compile");
        }
    }
}
