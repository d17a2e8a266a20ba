//! Application descriptors.
//!
//! Every application pipeline has the same shape; only names, registry and
//! build settings differ. [`PipelineSpec::for_application`] derives the whole
//! pipeline from one [`AppDescriptor`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::artifact::ArtifactDecl;
use crate::pipeline::{
    BuildSettings, DeploySettings, EnvBinding, PipelineSpec, RetryPolicy, StageSpec,
};
use crate::source::SourceLocator;

pub const SOURCE_STAGE: &str = "SourceCode";
pub const SOURCE_OUTPUT: &str = "SourceOutput";
pub const BUILD_OUTPUT: &str = "BuildOutput";

/// Everything that distinguishes one application pipeline from another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDescriptor {
    /// Application name (e.g., "chat-app").
    pub name: String,
    /// Target registry resource name.
    pub registry: String,
    pub source: SourceLocator,
    /// Build context, dockerfile and buildspec. An empty project name is
    /// filled in from the application name.
    pub build: BuildSettings,
    /// Parameter store key override. Defaults to the PascalCase app name.
    pub parameter_key: Option<String>,
    pub env: BTreeMap<String, EnvBinding>,
    /// Present when the pipeline deploys inline.
    pub deploy: Option<DeploySettings>,
    pub retry: RetryPolicy,
    /// Stacks the pipeline needs before it may run.
    pub requires: Vec<String>,
}

impl AppDescriptor {
    pub fn new(name: impl Into<String>, registry: impl Into<String>, source: SourceLocator) -> Self {
        Self {
            name: name.into(),
            registry: registry.into(),
            source,
            build: BuildSettings::default(),
            parameter_key: None,
            env: BTreeMap::new(),
            deploy: None,
            retry: RetryPolicy::default(),
            requires: Vec::new(),
        }
    }

    /// PascalCase form of the name: "chat-app" -> "ChatApp".
    pub fn pascal_name(&self) -> String {
        pascal_case(&self.name)
    }

    pub fn pipeline_name(&self) -> String {
        format!("CodePipeline{}", self.pascal_name())
    }

    pub fn build_stage_name(&self) -> String {
        format!("Build{}Image", self.pascal_name())
    }

    pub fn deploy_stage_name(&self) -> String {
        format!("Deploy{}", self.pascal_name())
    }

    pub fn parameter_key(&self) -> String {
        self.parameter_key
            .clone()
            .unwrap_or_else(|| self.pascal_name())
    }
}

/// Convert a dashed/underscored name to PascalCase.
pub fn pascal_case(name: &str) -> String {
    name.split(['-', '_', ' '])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

impl PipelineSpec {
    /// Derive the Source -> Build (-> Deploy) pipeline for an application.
    pub fn for_application(app: &AppDescriptor) -> PipelineSpec {
        let pascal = app.pascal_name();

        let mut build = app.build.clone();
        if build.project.is_empty() {
            build.project = format!("Build{}EcrImage", pascal);
        }

        let mut build_stage = StageSpec::build(
            app.build_stage_name(),
            build,
            ArtifactDecl::source(SOURCE_OUTPUT),
            ArtifactDecl::image(BUILD_OUTPUT),
        );
        build_stage.env = app.env.clone();

        let mut stages = vec![
            StageSpec::source(SOURCE_STAGE, ArtifactDecl::source(SOURCE_OUTPUT)),
            build_stage,
        ];
        if let Some(deploy) = &app.deploy {
            stages.push(StageSpec::deploy(
                app.deploy_stage_name(),
                deploy.clone(),
                ArtifactDecl::image(BUILD_OUTPUT),
            ));
        }

        PipelineSpec {
            name: app.pipeline_name(),
            application: app.name.clone(),
            source: app.source.clone(),
            registry: app.registry.clone(),
            parameter_key: app.parameter_key(),
            stages,
            retry: app.retry,
            requires: app.requires.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployer::DeployTarget;
    use crate::pipeline::{StageKind, DEFAULT_DEPLOY_TIMEOUT};

    fn app(name: &str) -> AppDescriptor {
        AppDescriptor::new(
            name,
            name,
            SourceLocator::CodeCommit {
                repository: name.into(),
                branch: "main".into(),
            },
        )
    }

    #[test]
    fn test_pascal_case() {
        assert_eq!(pascal_case("chat-app"), "ChatApp");
        assert_eq!(pascal_case("image_app"), "ImageApp");
        assert_eq!(pascal_case("blog--app"), "BlogApp");
        assert_eq!(pascal_case("flask"), "Flask");
    }

    #[test]
    fn test_build_only_pipeline() {
        let spec = PipelineSpec::for_application(&app("chat-app"));
        spec.validate().unwrap();

        assert_eq!(spec.name, "CodePipelineChatApp");
        assert_eq!(spec.parameter_key, "ChatApp");
        let kinds: Vec<_> = spec.stages.iter().map(|s| s.kind()).collect();
        assert_eq!(kinds, vec![StageKind::Source, StageKind::Build]);
        assert_eq!(spec.stages[1].name, "BuildChatAppImage");
        match &spec.stages[1].action {
            crate::pipeline::StageAction::Build(settings) => {
                assert_eq!(settings.project, "BuildChatAppEcrImage");
            }
            other => panic!("expected build action, got {:?}", other),
        }
    }

    #[test]
    fn test_variants_differ_only_in_naming() {
        let blog = PipelineSpec::for_application(&app("blog-app"));
        let image = PipelineSpec::for_application(&app("image-app"));
        assert_eq!(blog.stages.len(), image.stages.len());
        assert_eq!(blog.stages[0], image.stages[0]);
        assert_ne!(blog.stages[1].name, image.stages[1].name);
    }

    #[test]
    fn test_inline_deploy_and_parameter_override() {
        let mut descriptor = app("flask-app");
        descriptor.parameter_key = Some("FlaskApp".into());
        descriptor.env.insert(
            "DOCKERHUB_USERNAME".into(),
            EnvBinding::Parameter("DOCKERHUB_USERNAME".into()),
        );
        descriptor.deploy = Some(DeploySettings {
            target: DeployTarget {
                service: "flask".into(),
                cluster: Some("EksClusterLevel1".into()),
            },
            timeout: DEFAULT_DEPLOY_TIMEOUT,
        });

        let spec = PipelineSpec::for_application(&descriptor);
        spec.validate().unwrap();
        assert!(spec.has_deploy());
        assert_eq!(spec.parameter_key, "FlaskApp");
        assert_eq!(spec.stages[2].name, "DeployFlaskApp");
        assert!(spec.stages[1].env.contains_key("DOCKERHUB_USERNAME"));
    }
}
