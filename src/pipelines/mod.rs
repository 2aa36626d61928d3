pub mod aggregate;
pub mod batch;
pub mod stage;
pub mod variant_calling;
