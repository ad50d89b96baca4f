// Copyright 2024 Balena Ltd.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#[macro_use]
mod util;

mod bootloader;
mod cmdline;
mod configjson;
mod fetch;
mod fingerprint;
mod hostconfig;
mod io_util;
mod kernelcheck;
mod mbr;
mod orchestrator;
mod repartition;
mod topology;
mod updater;

use clap::Parser;

fn main() {
    let mut cli = cmdline::Cli::parse();
    cli.apply_env_overrides();

    let exit_code = match orchestrator::run(cli) {
        Ok(code) => code,
        Err(err) => {
            log::error!("{:#}", err);
            orchestrator::ExitCode::Failure
        }
    };
    std::process::exit(exit_code.as_process_code());
}
