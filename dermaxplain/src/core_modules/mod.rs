// Building blocks of the explanation pipeline, leaves first.

pub mod canonical;
pub mod oracle;
pub mod attribution_grid;
pub mod occlusion;
pub mod sampling;
pub mod renderer;
pub mod scan_store;
pub mod explainer;
pub mod delegate;
