//! Chart renderer based on MiniJinja

use chartpilot_core::{LoadedChart, TemplateContext};
use minijinja::{Environment, UndefinedBehavior};
use std::collections::BTreeMap;

use crate::error::{Result, TemplateError};
use crate::{filters, functions};

/// Rendering capability consumed by release actions
pub trait Renderer: Send + Sync {
    fn render(&self, chart: &LoadedChart, context: &TemplateContext) -> Result<RenderResult>;
}

/// Result of rendering a chart
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderResult {
    /// Rendered manifests by template name (`.j2` suffix dropped)
    pub manifests: BTreeMap<String, String>,

    /// Rendered `NOTES.txt`, if the chart has one
    pub notes: Option<String>,
}

impl RenderResult {
    /// All manifests as one multi-document YAML stream, in template name order
    pub fn combined(&self) -> String {
        let mut out = String::new();
        for (name, content) in &self.manifests {
            out.push_str("---\n# Source: ");
            out.push_str(name);
            out.push('\n');
            out.push_str(content.trim_start_matches("---\n").trim_end());
            out.push('\n');
        }
        out
    }
}

/// The template engine
#[derive(Debug, Clone)]
pub struct Engine {
    strict_mode: bool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Engine {
    /// Strict mode fails on undefined variables
    pub fn new(strict_mode: bool) -> Self {
        Self { strict_mode }
    }

    fn create_environment(&self) -> Environment<'static> {
        let mut env = Environment::new();

        env.set_undefined_behavior(if self.strict_mode {
            UndefinedBehavior::Strict
        } else {
            UndefinedBehavior::Lenient
        });

        env.add_filter("toyaml", filters::toyaml);
        env.add_filter("tojson", filters::tojson);
        env.add_filter("b64encode", filters::b64encode);
        env.add_filter("b64decode", filters::b64decode);
        env.add_filter("quote", filters::quote);
        env.add_filter("squote", filters::squote);
        env.add_filter("nindent", filters::nindent);
        env.add_filter("indent", filters::indent);
        env.add_filter("required", filters::required);
        env.add_filter("empty", filters::empty);
        env.add_filter("sha256", filters::sha256sum);
        env.add_filter("trunc", filters::trunc);
        env.add_filter("trimprefix", filters::trimprefix);
        env.add_filter("trimsuffix", filters::trimsuffix);

        env.add_function("fail", functions::fail);
        env.add_function("dict", functions::dict);
        env.add_function("coalesce", functions::coalesce);
        env.add_function("ternary", functions::ternary);
        env.add_function("tostring", functions::tostring);
        env.add_function("toint", functions::toint);

        env
    }

    /// Render a single template string
    pub fn render_string(
        &self,
        template: &str,
        context: &TemplateContext,
        template_name: &str,
    ) -> Result<String> {
        let mut env = self.create_environment();
        env.add_template_owned(template_name.to_string(), template.to_string())
            .map_err(|e| TemplateError::from_minijinja(e, template_name, template))?;

        let tmpl = env
            .get_template(template_name)
            .map_err(|e| TemplateError::from_minijinja(e, template_name, template))?;

        Ok(tmpl
            .render(context.to_json())
            .map_err(|e| TemplateError::from_minijinja(e, template_name, template))?)
    }
}

fn is_helper(name: &str) -> bool {
    name.rsplit('/').next().is_some_and(|file| file.starts_with('_'))
}

fn is_notes(name: &str) -> bool {
    name.eq_ignore_ascii_case("NOTES.txt") || name.eq_ignore_ascii_case("NOTES.txt.j2")
}

impl Renderer for Engine {
    fn render(&self, chart: &LoadedChart, context: &TemplateContext) -> Result<RenderResult> {
        let mut env = self.create_environment();

        // Helpers are loaded too so `import`/`include` can reach them
        for (name, source) in &chart.templates {
            env.add_template_owned(name.clone(), source.clone())
                .map_err(|e| TemplateError::from_minijinja(e, name, source))?;
        }

        let ctx = context.to_json();
        let mut result = RenderResult::default();

        for (name, source) in &chart.templates {
            if is_helper(name) {
                continue;
            }

            let rendered = env
                .get_template(name)
                .and_then(|tmpl| tmpl.render(&ctx))
                .map_err(|e| TemplateError::from_minijinja(e, name, source))?;

            if is_notes(name) {
                result.notes = Some(rendered);
                continue;
            }

            let trimmed = rendered.trim();
            if trimmed.is_empty() || trimmed == "---" {
                continue;
            }

            let output_name = name.trim_end_matches(".j2").to_string();
            result.manifests.insert(output_name, rendered);
        }

        tracing::debug!(
            chart = %chart.name(),
            release = %context.release.name,
            manifests = result.manifests.len(),
            "rendered chart"
        );

        Ok(result)
    }
}
