use std::path::PathBuf;

use clap::Parser;

use crate::config::defs::{
    BCFTOOLS_TAG, BWA_TAG, DEFAULT_HASH_LEN, DEFAULT_MIN_QUALITY, FASTP_TAG, FASTQ_GZ_SUFFIX,
};

#[derive(Parser, Debug, Clone)]
#[command(name = "seqstage", version, about = "Paired-end sample staging and variant discovery")]
pub struct Arguments {

    #[arg(short, long, help = "discover | variant_discovery")]
    pub module: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 's', long = "seq-dir", help = "Directory of <sample>_<mate> read files")]
    pub seq_dir: PathBuf,

    #[arg(short = 'r', long = "reference", help = "Reference FASTA, as a path or file:// URI")]
    pub reference: Option<String>,

    #[arg(short = 'o', long = "out", help = "Output directory. Defaults to 'seqstage_YYYYMMDD' in the current working directory.")]
    pub out_dir: Option<PathBuf>,

    #[arg(long = "filter-tool", default_value = FASTP_TAG)]
    pub filter_tool: String,

    #[arg(long = "aligner", default_value = BWA_TAG)]
    pub aligner: String,

    #[arg(long = "caller", default_value = BCFTOOLS_TAG)]
    pub caller: String,

    #[arg(long = "protein-tool", help = "Run protein prediction with this tool, e.g. prodigal")]
    pub protein_tool: Option<String>,

    #[arg(long, default_value_t = 64)]
    pub threads: usize,

    #[arg(long = "max-parallel", default_value_t = 4)]
    pub max_parallel_samples: usize,

    #[arg(long = "hash-len", default_value_t = DEFAULT_HASH_LEN)]
    pub hash_len: usize,

    #[arg(short = 'q', long = "quality", default_value_t = DEFAULT_MIN_QUALITY)]
    pub quality: u8,

    #[arg(long, default_value = FASTQ_GZ_SUFFIX)]
    pub suffix: String,

    #[arg(long, default_value_t = false, help = "Require the first read ids of both mates to pair up")]
    pub verify_headers: bool,

    #[arg(long, default_value_t = 3)]
    pub storage_retries: usize,

    #[arg(long, help = "Copy final VCFs into this directory")]
    pub publish: Option<PathBuf>,

    #[arg(long, default_value_t = false, help = "Ask each selected tool for its version before running")]
    pub check_tools: bool,
}
