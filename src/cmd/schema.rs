//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;

use crate::{
    async_utils::io::write_json_output,
    prelude::*,
};

use super::{
    generate::{PaperOutput, PaperRequest},
    ocr::OcrOutput,
};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// A request file for `generate --request`.
    PaperRequest,
    /// JSON output from `generate`.
    PaperOutput,
    /// One page of JSON output from `ocr`.
    OcrOutput,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::PaperRequest => schema_for!(PaperRequest),
        SchemaType::PaperOutput => schema_for!(PaperOutput),
        SchemaType::OcrOutput => schema_for!(OcrOutput),
    };
    write_json_output(schema_opts.output_path.as_deref(), &schema).await
}
