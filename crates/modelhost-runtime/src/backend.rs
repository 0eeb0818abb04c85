//! Engine command lines built from recipes

use modelhost_core::{Backend, BackendConfig, Recipe, RecipeId};
use std::collections::HashMap;

/// Everything the supervisor needs to start one engine process
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub backend: Backend,
    pub model_path: String,
    pub port: u16,
    pub served_model_name: String,
    pub health_path: String,
    pub recipe_id: Option<RecipeId>,
}

impl LaunchSpec {
    /// Build the engine invocation for `recipe` using its backend's template
    pub fn from_recipe(recipe: &Recipe, backend: &BackendConfig) -> Self {
        let port = recipe.port.unwrap_or(backend.default_port);
        let served_model_name = recipe.served_model_name().to_string();

        let mut command = backend.command.iter().cloned();
        let program = command.next().unwrap_or_default();
        let mut args: Vec<String> = command.collect();

        match recipe.backend {
            Backend::Vllm => {
                args.push("serve".to_string());
                args.push(recipe.model_path.clone());
                push_flag(&mut args, "--port", port);
                push_flag(&mut args, "--served-model-name", &served_model_name);
                if let Some(tp) = recipe.tensor_parallel_size {
                    push_flag(&mut args, "--tensor-parallel-size", tp);
                }
                if let Some(len) = recipe.max_model_len {
                    push_flag(&mut args, "--max-model-len", len);
                }
                if let Some(util) = recipe.gpu_memory_utilization {
                    push_flag(&mut args, "--gpu-memory-utilization", util);
                }
            }
            Backend::Sglang => {
                push_flag(&mut args, "--model-path", &recipe.model_path);
                push_flag(&mut args, "--port", port);
                push_flag(&mut args, "--served-model-name", &served_model_name);
                if let Some(tp) = recipe.tensor_parallel_size {
                    push_flag(&mut args, "--tp", tp);
                }
                if let Some(len) = recipe.max_model_len {
                    push_flag(&mut args, "--context-length", len);
                }
                if let Some(util) = recipe.gpu_memory_utilization {
                    push_flag(&mut args, "--mem-fraction-static", util);
                }
            }
        }
        args.extend(recipe.extra_args.iter().cloned());

        Self {
            program,
            args,
            env: recipe.env.clone(),
            backend: recipe.backend,
            model_path: recipe.model_path.clone(),
            port,
            served_model_name,
            health_path: backend.health_path.clone(),
            recipe_id: Some(recipe.id.clone()),
        }
    }

    /// Full command line for logs
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn push_flag(args: &mut Vec<String>, flag: &str, value: impl ToString) {
    args.push(flag.to_string());
    args.push(value.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelhost_core::BackendsConfig;

    #[test]
    fn test_vllm_command() {
        let mut recipe = Recipe::new("llama-8b", "/models/llama", Backend::Vllm);
        recipe.tensor_parallel_size = Some(2);
        recipe.max_model_len = Some(8192);
        recipe.gpu_memory_utilization = Some(0.9);
        recipe.extra_args = vec!["--enforce-eager".to_string()];

        let backends = BackendsConfig::default();
        let spec = LaunchSpec::from_recipe(&recipe, backends.get(Backend::Vllm));

        assert_eq!(spec.program, "vllm");
        assert_eq!(
            spec.args,
            vec![
                "serve",
                "/models/llama",
                "--port",
                "8000",
                "--served-model-name",
                "llama-8b",
                "--tensor-parallel-size",
                "2",
                "--max-model-len",
                "8192",
                "--gpu-memory-utilization",
                "0.9",
                "--enforce-eager",
            ]
        );
        assert_eq!(spec.port, 8000);
        assert_eq!(spec.health_path, "/health");
        assert_eq!(spec.recipe_id, Some(RecipeId::new("llama-8b")));
    }

    #[test]
    fn test_sglang_command() {
        let mut recipe = Recipe::new("qwen", "Qwen/Qwen2.5-7B", Backend::Sglang);
        recipe.port = Some(31000);
        recipe.served_model_name = Some("qwen-chat".to_string());
        recipe.max_model_len = Some(4096);

        let backends = BackendsConfig::default();
        let spec = LaunchSpec::from_recipe(&recipe, backends.get(Backend::Sglang));

        assert_eq!(spec.program, "python");
        assert_eq!(
            spec.args,
            vec![
                "-m",
                "sglang.launch_server",
                "--model-path",
                "Qwen/Qwen2.5-7B",
                "--port",
                "31000",
                "--served-model-name",
                "qwen-chat",
                "--context-length",
                "4096",
            ]
        );
        assert_eq!(spec.served_model_name, "qwen-chat");
        assert!(spec.command_line().starts_with("python -m sglang.launch_server"));
    }
}
