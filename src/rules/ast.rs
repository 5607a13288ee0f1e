//! Abstract syntax tree for the rule expression grammar (spec §4.8, §6.5).
//! Intentionally small: the grammar admits no function calls, attribute
//! access, subscription, lambdas, comprehensions, or assignment, so there is
//! no `Call`/`Index`/`Lambda` variant to even construct.

/// One of the eight fields a rule expression may reference (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identifier {
    Rank,
    Score,
    LiquidityEdge,
    MomentumEdge,
    VolatilityEdge,
    MicrostructureEdge,
    AnomalyResidual,
    ManipulationScore,
}

impl Identifier {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "rank" => Self::Rank,
            "score" => Self::Score,
            "liquidity_edge" => Self::LiquidityEdge,
            "momentum_edge" => Self::MomentumEdge,
            "volatility_edge" => Self::VolatilityEdge,
            "microstructure_edge" => Self::MicrostructureEdge,
            "anomaly_residual" => Self::AnomalyResidual,
            "manipulation_score" => Self::ManipulationScore,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Str(String),
    Bool(bool),
    Null,
    Ident(Identifier),
    Unary(UnaryOp, Box<Expr>),
    Binary(Box<Expr>, BinOp, Box<Expr>),
}
