//! Campaign graph model and definition parsing

pub mod model;
pub mod parser;

pub use model::{
    Button, CampaignDefinition, CampaignGraph, Condition, DelayParams, DelayUnit, Edge, LabelParams,
    LinkCampaignParams, MediaParams, MediaType, MessageParams, Node, NodeKind, RandomizerParams,
    TemplateParams, ZoneAction, HANDLE_A, HANDLE_B, HANDLE_FALSE, HANDLE_TRUE,
};
