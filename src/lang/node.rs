use serde::{Deserialize, Serialize};

/// Literal payloads as they come out of the parser.
///
/// Only numbers and booleans can be compiled; the other forms exist because
/// the parser accepts them and the compiler has to reject them explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Number(f64),
    Bool(bool),
    String(String),
    Null,
}

/// Abstract Syntax Tree node for the source language.
///
/// Statements and expressions share one type, mirroring the tagged-list
/// representation produced by the parser. Operators are carried as their
/// source symbols (`"+"`, `"==="`, `"&&"`, ...) so that an operator the
/// compiler does not know is reported at compile time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    // ───────────────────────────── Literals ─────────────────────────────
    /// A numeric or boolean literal.
    Literal(Literal),

    /// A name reference. The name `undefined` denotes the undefined value.
    Name(String),

    // ───────────────────────────── Operators ────────────────────────────
    /// Prefix operator application, e.g. `!x`.
    UnaryOperator { operator: String, operand: Box<Node> },

    /// Infix operator application, e.g. `a + b`.
    BinaryOperator {
        operator: String,
        left: Box<Node>,
        right: Box<Node>,
    },

    /// Short-circuiting `&&` / `||`.
    LogicalComposition {
        operator: String,
        left: Box<Node>,
        right: Box<Node>,
    },

    /// `predicate ? consequent : alternative`
    Conditional {
        predicate: Box<Node>,
        consequent: Box<Node>,
        alternative: Box<Node>,
    },

    // ───────────────────────────── Functions ────────────────────────────
    /// `function(arguments...)`
    Application {
        function: Box<Node>,
        arguments: Vec<Node>,
    },

    /// `(parameters) => body`
    Lambda {
        parameters: Vec<String>,
        body: Box<Node>,
    },

    /// `function name(parameters) { body }`
    FunctionDeclaration {
        name: String,
        parameters: Vec<String>,
        body: Box<Node>,
    },

    /// `return expression;`
    Return(Box<Node>),

    // ───────────────────────────── Statements ───────────────────────────
    /// A list of statements; evaluates to the value of the last one.
    Sequence(Vec<Node>),

    /// `{ body }`
    Block(Box<Node>),

    /// `const name = value;`
    ConstantDeclaration { name: String, value: Box<Node> },

    /// `let name = value;`
    VariableDeclaration { name: String, value: Box<Node> },

    /// `name = value;`
    Assignment { name: String, value: Box<Node> },

    /// `while (condition) { body }`
    While {
        condition: Box<Node>,
        body: Box<Node>,
    },
}

impl Node {
    pub fn num(value: f64) -> Self {
        Node::Literal(Literal::Number(value))
    }

    pub fn bool(value: bool) -> Self {
        Node::Literal(Literal::Bool(value))
    }

    pub fn undefined() -> Self {
        Node::Name("undefined".to_string())
    }

    pub fn name(name: &str) -> Self {
        Node::Name(name.to_string())
    }

    pub fn unary(operator: &str, operand: Node) -> Self {
        Node::UnaryOperator {
            operator: operator.to_string(),
            operand: Box::new(operand),
        }
    }

    pub fn binary(operator: &str, left: Node, right: Node) -> Self {
        Node::BinaryOperator {
            operator: operator.to_string(),
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn logical(operator: &str, left: Node, right: Node) -> Self {
        Node::LogicalComposition {
            operator: operator.to_string(),
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn conditional(predicate: Node, consequent: Node, alternative: Node) -> Self {
        Node::Conditional {
            predicate: Box::new(predicate),
            consequent: Box::new(consequent),
            alternative: Box::new(alternative),
        }
    }

    pub fn apply(function: Node, arguments: Vec<Node>) -> Self {
        Node::Application {
            function: Box::new(function),
            arguments,
        }
    }

    pub fn lambda(parameters: &[&str], body: Node) -> Self {
        Node::Lambda {
            parameters: parameters.iter().map(|p| p.to_string()).collect(),
            body: Box::new(body),
        }
    }

    /// Expression-bodied arrow function. The parser hands these over with an
    /// implicit `return` around the expression.
    pub fn arrow(parameters: &[&str], expression: Node) -> Self {
        Node::lambda(parameters, Node::ret(expression))
    }

    pub fn function(name: &str, parameters: &[&str], body: Node) -> Self {
        Node::FunctionDeclaration {
            name: name.to_string(),
            parameters: parameters.iter().map(|p| p.to_string()).collect(),
            body: Box::new(body),
        }
    }

    pub fn ret(expression: Node) -> Self {
        Node::Return(Box::new(expression))
    }

    pub fn seq(statements: Vec<Node>) -> Self {
        Node::Sequence(statements)
    }

    pub fn block(body: Node) -> Self {
        Node::Block(Box::new(body))
    }

    pub fn constant(name: &str, value: Node) -> Self {
        Node::ConstantDeclaration {
            name: name.to_string(),
            value: Box::new(value),
        }
    }

    pub fn variable(name: &str, value: Node) -> Self {
        Node::VariableDeclaration {
            name: name.to_string(),
            value: Box::new(value),
        }
    }

    pub fn assign(name: &str, value: Node) -> Self {
        Node::Assignment {
            name: name.to_string(),
            value: Box::new(value),
        }
    }

    pub fn while_loop(condition: Node, body: Node) -> Self {
        Node::While {
            condition: Box::new(condition),
            body: Box::new(body),
        }
    }

    /// Whether this node is the built-in `undefined` name.
    pub fn is_undefined(&self) -> bool {
        matches!(self, Node::Name(name) if name == "undefined")
    }

    /// Short human-readable name of the node kind, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Literal(_) => "literal",
            Node::Name(_) => "name",
            Node::UnaryOperator { .. } => "unary operator combination",
            Node::BinaryOperator { .. } => "binary operator combination",
            Node::LogicalComposition { .. } => "logical composition",
            Node::Conditional { .. } => "conditional expression",
            Node::Application { .. } => "application",
            Node::Lambda { .. } => "lambda expression",
            Node::FunctionDeclaration { .. } => "function declaration",
            Node::Return(_) => "return statement",
            Node::Sequence(_) => "sequence",
            Node::Block(_) => "block",
            Node::ConstantDeclaration { .. } => "constant declaration",
            Node::VariableDeclaration { .. } => "variable declaration",
            Node::Assignment { .. } => "assignment",
            Node::While { .. } => "while loop",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arrow_wraps_body_in_return() {
        let node = Node::arrow(&["x"], Node::name("x"));
        match node {
            Node::Lambda { parameters, body } => {
                assert_eq!(parameters, vec!["x".to_string()]);
                assert_eq!(*body, Node::ret(Node::name("x")));
            }
            other => panic!("expected lambda, got {:?}", other),
        }
    }

    #[test]
    fn test_undefined_is_a_name() {
        assert!(Node::undefined().is_undefined());
        assert!(!Node::name("x").is_undefined());
        assert_eq!(Node::undefined().kind(), "name");
    }
}
