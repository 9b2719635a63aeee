use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use super::template::{render_date, render_vars};
use crate::cache::CachedFileRecord;
use crate::config::CommandConfig;
use crate::stage::{StageError, StageUnitProcessor, UnitContext};

const INPUTS_TOKEN: &str = "{inputs}";
const INPUT_TOKEN_PREFIX: &str = "{input:";

/// Runs an external program once per work unit.
///
/// Summary units run the program once per index found in the inputs, with
/// `{index}` bound and only that index's files as inputs.
pub struct CommandProcessor {
    name: String,
    config: CommandConfig,
}

impl CommandProcessor {
    pub fn new(name: impl Into<String>, config: CommandConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    fn render(&self, template: &str, ctx: &UnitContext, index: Option<&str>, output: &Path) -> String {
        let mut vars = vec![
            ("project", ctx.project.clone()),
            ("plugin", ctx.plugin.clone()),
            ("date", ctx.date.to_string()),
            ("output", output.to_string_lossy().into_owned()),
            ("output_dir", ctx.output_dir.to_string_lossy().into_owned()),
        ];
        if let Some(index) = index {
            vars.push(("index", index.to_string()));
        }
        if let Some(summary) = &ctx.summary {
            if let Some(field) = &summary.zone_field {
                vars.push(("zone_field", field.clone()));
            }
            if let Some(shapefile) = &summary.shapefile {
                vars.push(("shapefile", shapefile.to_string_lossy().into_owned()));
            }
        }
        render_date(&render_vars(template, &vars), ctx.date)
    }

    fn build_args(
        &self,
        inputs: &[&CachedFileRecord],
        ctx: &UnitContext,
        index: Option<&str>,
        output: &Path,
    ) -> Result<Vec<String>, StageError> {
        let paths: Vec<String> = inputs
            .iter()
            .map(|r| r.path.to_string_lossy().into_owned())
            .collect();

        let mut args = Vec::new();
        for template in &self.config.args {
            if template == INPUTS_TOKEN {
                args.extend(paths.iter().cloned());
                continue;
            }
            let arg = self.render(template, ctx, index, output);
            args.push(substitute_inputs(&arg, inputs, &paths)?);
        }
        Ok(args)
    }

    async fn run_once(
        &self,
        inputs: &[&CachedFileRecord],
        ctx: &UnitContext,
        index: Option<&str>,
    ) -> Result<PathBuf, StageError> {
        let output = ctx
            .output_dir
            .join(self.render(&self.config.output, ctx, index, &ctx.output_dir));
        let args = self.build_args(inputs, ctx, index, &output)?;

        debug!(
            implementation = %self.name,
            program = %self.config.program,
            date = %ctx.date,
            "Running command"
        );

        let result = Command::new(&self.config.program)
            .args(&args)
            .current_dir(&ctx.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| StageError::Command {
                program: self.config.program.clone(),
                message: if e.kind() == std::io::ErrorKind::NotFound {
                    "program not found".to_string()
                } else {
                    e.to_string()
                },
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(StageError::Command {
                program: self.config.program.clone(),
                message: format!(
                    "{}: {}",
                    result.status,
                    stderr.chars().take(200).collect::<String>()
                ),
            });
        }
        if !tokio::fs::try_exists(&output).await? {
            return Err(StageError::Command {
                program: self.config.program.clone(),
                message: format!("did not produce {}", output.display()),
            });
        }
        Ok(output)
    }
}

/// Expand `{inputs}` and `{input:<data name>}` tokens. Inserted paths are
/// never scanned for tokens again.
fn substitute_inputs(
    template: &str,
    inputs: &[&CachedFileRecord],
    paths: &[String],
) -> Result<String, StageError> {
    let mut arg = String::with_capacity(template.len());
    let mut rest = template;
    loop {
        let next = [INPUTS_TOKEN, INPUT_TOKEN_PREFIX]
            .iter()
            .filter_map(|token| rest.find(token).map(|at| (at, *token)))
            .min_by_key(|(at, _)| *at);
        let Some((start, token)) = next else {
            break;
        };

        arg.push_str(&rest[..start]);
        if token == INPUTS_TOKEN {
            arg.push_str(&paths.join(" "));
            rest = &rest[start + token.len()..];
            continue;
        }

        let Some(len) = rest[start..].find('}') else {
            arg.push_str(&rest[start..]);
            return Ok(arg);
        };
        let data_name = &rest[start + token.len()..start + len];
        let record = inputs
            .iter()
            .find(|r| r.data_name == data_name)
            .ok_or_else(|| StageError::MissingInput(data_name.to_string()))?;
        arg.push_str(&record.path.to_string_lossy());
        rest = &rest[start + len + 1..];
    }
    arg.push_str(rest);
    Ok(arg)
}

#[async_trait]
impl StageUnitProcessor for CommandProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        inputs: &[CachedFileRecord],
        ctx: &UnitContext,
    ) -> Result<Vec<CachedFileRecord>, StageError> {
        tokio::fs::create_dir_all(&ctx.output_dir).await?;

        let Some(summary) = &ctx.summary else {
            let all: Vec<&CachedFileRecord> = inputs.iter().collect();
            let path = self.run_once(&all, ctx, None).await?;
            let data_name = self
                .config
                .output_data_name
                .clone()
                .unwrap_or_else(|| self.name.clone());
            return Ok(vec![ctx.output_record(data_name, path)]);
        };

        let mut outputs = Vec::new();
        for index in &ctx.indices {
            let selected: Vec<&CachedFileRecord> =
                inputs.iter().filter(|r| &r.data_name == index).collect();
            if selected.is_empty() {
                continue;
            }
            let path = self.run_once(&selected, ctx, Some(index)).await?;
            outputs.push(ctx.output_record(summary.output_data_name(index), path));
        }
        Ok(outputs)
    }
}
