/*
 *
 *  * // Copyright (c) 2023 Huawei Technologies Co.,Ltd. All rights reserved.
 *  * //
 *  * // signatrust is licensed under Mulan PSL v2.
 *  * // You can use this software according to the terms and conditions of the Mulan
 *  * // PSL v2.
 *  * // You may obtain a copy of Mulan PSL v2 at:
 *  * //         http://license.coscl.org.cn/MulanPSL2
 *  * // THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
 *  * // KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
 *  * // NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
 *  * // See the Mulan PSL v2 for more details.
 *
 */
use clap::{Args, Parser, Subcommand};
use log::debug;
use pe_signer::{
    DigestAlgorithm, OpensslKeyStore, PeFile, PeSigner, SignOptions, SignaturePolicy,
    SigningIdentity, TimestampConfig, TimestampProtocol, Timestamper,
};
use std::env;
use std::fs::read;
use std::path::Path;
use std::str::FromStr;

const ALIAS: &str = "cli";

#[derive(Parser)]
#[command(name = "pe_signer examples")]
#[command(version = "0.1")]
#[command(about = "Sign and timestamp PE images", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[arg(short, long)]
    #[arg(help = "print more info")]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Sign a PE image with key and cert", long_about = None)]
    Sign(Sign),
    #[command(about = "Timestamp the signatures of a signed PE image", long_about = None)]
    Timestamp(Timestamp),
    #[command(about = "Print the layout and signatures of a PE image", long_about = None)]
    Info(Image),
    #[command(about = "Check the signatures of a PE image", long_about = None)]
    Verify(Image),
    #[command(about = "Remove all signatures of a PE image", long_about = None)]
    Remove(Remove),
}

#[derive(Args)]
struct Image {
    #[arg(help = "PE image path")]
    path: String,
}

#[derive(Args)]
struct Remove {
    #[arg(help = "PE image path")]
    path: String,
    #[arg(help = "output path, the input is overwritten when omitted")]
    output: Option<String>,
}

#[derive(Args)]
struct TsaArgs {
    #[arg(long = "tsa")]
    #[arg(help = "timestamp authority url, may be repeated")]
    urls: Vec<String>,
    #[arg(long, default_value = "rfc3161")]
    #[arg(help = "timestamp protocol: rfc3161 or authenticode")]
    protocol: String,
    #[arg(long, default_value_t = 3)]
    #[arg(help = "timestamp attempts")]
    retries: u32,
}

impl TsaArgs {
    fn config(&self) -> TimestampConfig {
        let protocol = match self.protocol.as_str() {
            "authenticode" => TimestampProtocol::Authenticode,
            _ => TimestampProtocol::Rfc3161,
        };
        TimestampConfig {
            protocol,
            urls: self.urls.clone(),
            retries: self.retries,
            ..Default::default()
        }
    }
}

#[derive(Args)]
struct Sign {
    #[arg(long, short, required(true))]
    #[arg(help = "private key in pem format")]
    key: String,
    #[arg(long, short, required(true))]
    #[arg(help = "certificate chain in pem format, leaf first")]
    cert: String,
    #[arg(long, short, default_value = "SHA256")]
    #[arg(help = "digest algorithm")]
    digest: String,
    #[arg(long)]
    #[arg(help = "replace existing signatures instead of adding one")]
    replace: bool,
    #[arg(long)]
    #[arg(help = "program name embedded in the signature")]
    name: Option<String>,
    #[arg(long)]
    #[arg(help = "program url embedded in the signature")]
    url: Option<String>,
    #[arg(long)]
    #[arg(help = "json file with signing options, overridden by the flags above")]
    config: Option<String>,
    #[arg(long)]
    #[arg(help = "timestamp the new signature")]
    timestamp: bool,
    #[command(flatten)]
    tsa: TsaArgs,
    #[arg(help = "PE image path to sign")]
    path: String,
    #[arg(help = "output path, the input is overwritten when omitted")]
    output: Option<String>,
}

#[derive(Args)]
struct Timestamp {
    #[command(flatten)]
    tsa: TsaArgs,
    #[arg(help = "PE image path to timestamp")]
    path: String,
    #[arg(help = "output path, the input is overwritten when omitted")]
    output: Option<String>,
}

fn save(pe: &PeFile, output: &Option<String>) {
    match output {
        Some(path) => pe.save_as(path).unwrap(),
        None => pe.save().unwrap(),
    }
}

fn sign(s: &Sign) {
    let mut options: SignOptions = match &s.config {
        Some(path) => serde_json::from_slice(&read(path).unwrap()).unwrap(),
        None => SignOptions::default(),
    };
    options.digest_algorithm = DigestAlgorithm::from_str(&s.digest).unwrap();
    if s.replace {
        options.policy = SignaturePolicy::Replace;
    }
    if s.name.is_some() {
        options.program_name = s.name.clone();
    }
    if s.url.is_some() {
        options.program_url = s.url.clone();
    }
    if s.timestamp {
        options.timestamp = Some(s.tsa.config());
    }
    debug!("sign options: {:?}", options);

    let store = OpensslKeyStore::from_pem(ALIAS, &read(&s.key).unwrap(), &read(&s.cert).unwrap())
        .unwrap();
    let identity = SigningIdentity::from_store(&store, ALIAS).unwrap();
    let signer = PeSigner::new(identity, options).unwrap();

    let output = s.output.as_deref().map(Path::new);
    signer.sign_file(&s.path, output).unwrap();
    PeFile::open(output.unwrap_or(Path::new(&s.path)))
        .unwrap()
        .print_info()
        .unwrap();
}

fn timestamp(t: &Timestamp) {
    let mut pe = PeFile::open(&t.path).unwrap();
    let timestamper = Timestamper::new(t.tsa.config()).unwrap();
    let stamped = pe_signer::timestamp_signatures(&mut pe, &timestamper).unwrap();
    println!("{} signature(s) timestamped", stamped);
    save(&pe, &t.output);
}

fn info(path: &str) {
    let pe = PeFile::open(path).unwrap();
    pe.print_info().unwrap();
    for (i, sig) in pe.signatures().unwrap().iter().enumerate() {
        println!(
            "signature {}: {} {:02x?}",
            i,
            sig.digest_algorithm().unwrap(),
            sig.digest()
        );
    }
}

fn verify(path: &str) {
    let pe = PeFile::open(path).unwrap();
    match pe.verify() {
        Ok(()) => println!("{}: ok", path),
        Err(e) => {
            println!("{}: {}", path, e);
            std::process::exit(1);
        }
    }
}

fn remove(r: &Remove) {
    let mut pe = PeFile::open(&r.path).unwrap();
    pe_signer::remove_signatures(&mut pe).unwrap();
    save(&pe, &r.output);
}

fn main() {
    //prepare config and logger
    let app = Cli::parse();
    if app.verbose {
        println!("debug enabled");
        env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    match app.command {
        Commands::Sign(s) => sign(&s),
        Commands::Timestamp(t) => timestamp(&t),
        Commands::Info(i) => info(&i.path),
        Commands::Verify(v) => verify(&v.path),
        Commands::Remove(r) => remove(&r),
    }
}
