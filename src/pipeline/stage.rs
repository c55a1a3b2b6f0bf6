//! Stage templates.
//!
//! The five parcellation scales run the same six-step sequence and differ
//! only in the annotation name and output file stem. A single
//! [`StageTemplate`] expands a [`ScaleDefinition`] into that sequence, so
//! the scales cannot drift apart.
//!
//! Step order inside a scale stage:
//!
//! ```text
//! lh-map ─┐
//!         ├─→ lh-stats ─┐
//! rh-map ─┘   rh-stats ─┴─→ aparc2aseg ─→ convert
//! ```
//!
//! Steps run strictly in the listed order, which satisfies every
//! per-hemisphere dependency.

use serde::{Deserialize, Serialize};

use super::scale::{Hemisphere, ScaleDefinition, DEFAULT_ATLAS};
use super::subject::Subject;
use crate::environment::ToolkitEnvironment;
use crate::runner::ToolInvocation;

/// Default population-average subject holding the atlas annotations.
pub const DEFAULT_SOURCE_SUBJECT: &str = "fsaverage";

/// Default thread-count hint passed to multithreaded tools.
pub const DEFAULT_THREADS: usize = 8;

/// Kind of step within a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    /// Full surface/volume reconstruction from the input image.
    ReconAll,
    LhMap,
    RhMap,
    LhStats,
    RhStats,
    Aparc2Aseg,
    Convert,
}

impl StepKind {
    /// Scale stage steps in execution order.
    pub const SCALE_ORDER: [StepKind; 6] = [
        StepKind::LhMap,
        StepKind::RhMap,
        StepKind::LhStats,
        StepKind::RhStats,
        StepKind::Aparc2Aseg,
        StepKind::Convert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::ReconAll => "recon-all",
            StepKind::LhMap => "lh-map",
            StepKind::RhMap => "rh-map",
            StepKind::LhStats => "lh-stats",
            StepKind::RhStats => "rh-stats",
            StepKind::Aparc2Aseg => "aparc2aseg",
            StepKind::Convert => "convert",
        }
    }

    fn map(hemi: Hemisphere) -> Self {
        match hemi {
            Hemisphere::Lh => StepKind::LhMap,
            Hemisphere::Rh => StepKind::RhMap,
        }
    }

    fn stats(hemi: Hemisphere) -> Self {
        match hemi {
            Hemisphere::Lh => StepKind::LhStats,
            Hemisphere::Rh => StepKind::RhStats,
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which part of a pipeline run a stage belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageLabel {
    Reconstruction,
    Scale(ScaleDefinition),
}

impl std::fmt::Display for StageLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageLabel::Reconstruction => write!(f, "reconstruction"),
            StageLabel::Scale(scale) => write!(f, "{}", scale),
        }
    }
}

/// One step of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStep {
    pub kind: StepKind,
    pub invocation: ToolInvocation,
}

/// Ordered list of invocations for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub label: StageLabel,
    pub steps: Vec<StageStep>,
}

impl Stage {
    /// Step kinds in order.
    pub fn kinds(&self) -> Vec<StepKind> {
        self.steps.iter().map(|s| s.kind).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Template that expands scales and subjects into concrete stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTemplate {
    atlas: String,
    source_subject: String,
    threads: usize,
}

impl Default for StageTemplate {
    fn default() -> Self {
        Self {
            atlas: DEFAULT_ATLAS.to_string(),
            source_subject: DEFAULT_SOURCE_SUBJECT.to_string(),
            threads: DEFAULT_THREADS,
        }
    }
}

impl StageTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_atlas(mut self, atlas: impl Into<String>) -> Self {
        self.atlas = atlas.into();
        self
    }

    pub fn with_source_subject(mut self, subject: impl Into<String>) -> Self {
        self.source_subject = subject.into();
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn atlas(&self) -> &str {
        &self.atlas
    }

    /// The single-invocation reconstruction stage.
    pub fn reconstruction(&self, subject: &Subject, env: &ToolkitEnvironment) -> Stage {
        let invocation = env
            .invocation("recon-all")
            .arg("-s")
            .arg(subject.id())
            .arg("-i")
            .path_arg(subject.input_image())
            .arg("-threads")
            .arg(self.threads.to_string())
            .arg("-all");

        Stage {
            label: StageLabel::Reconstruction,
            steps: vec![StageStep {
                kind: StepKind::ReconAll,
                invocation,
            }],
        }
    }

    /// Expands one scale for one subject into its six ordered steps.
    ///
    /// Pure: the same scale, subject and environment always produce the
    /// same stage.
    pub fn expand(
        &self,
        scale: ScaleDefinition,
        subject: &Subject,
        env: &ToolkitEnvironment,
    ) -> Stage {
        let mut steps = Vec::with_capacity(StepKind::SCALE_ORDER.len());

        for hemi in Hemisphere::BOTH {
            steps.push(StageStep {
                kind: StepKind::map(hemi),
                invocation: self.surface_mapping(scale, hemi, subject, env),
            });
        }
        for hemi in Hemisphere::BOTH {
            steps.push(StageStep {
                kind: StepKind::stats(hemi),
                invocation: self.anatomical_stats(scale, hemi, subject, env),
            });
        }
        steps.push(StageStep {
            kind: StepKind::Aparc2Aseg,
            invocation: self.aparc_to_aseg(scale, subject, env),
        });
        steps.push(StageStep {
            kind: StepKind::Convert,
            invocation: self.convert(scale, subject, env),
        });

        Stage {
            label: StageLabel::Scale(scale),
            steps,
        }
    }

    fn surface_mapping(
        &self,
        scale: ScaleDefinition,
        hemi: Hemisphere,
        subject: &Subject,
        env: &ToolkitEnvironment,
    ) -> ToolInvocation {
        let annot = scale.annot_file(&self.atlas, hemi);
        let source_annot = env
            .subjects_dir()
            .join(&self.source_subject)
            .join("label")
            .join(&annot);

        env.invocation("mri_surf2surf")
            .arg("--srcsubject")
            .arg(&self.source_subject)
            .arg("--trgsubject")
            .arg(subject.id())
            .arg("--hemi")
            .arg(hemi.as_str())
            .arg("--sval-annot")
            .path_arg(source_annot)
            .arg("--tval")
            .path_arg(subject.label_path(&annot))
    }

    fn anatomical_stats(
        &self,
        scale: ScaleDefinition,
        hemi: Hemisphere,
        subject: &Subject,
        env: &ToolkitEnvironment,
    ) -> ToolInvocation {
        env.invocation("mris_anatomical_stats")
            .args(["-th3", "-mgz", "-noglobal"])
            .arg("-cortex")
            .path_arg(subject.label_path(&format!("{}.cortex.label", hemi)))
            .arg("-f")
            .path_arg(subject.stats_path(&scale.stats_file(&self.atlas, hemi)))
            .arg("-b")
            .arg("-a")
            .path_arg(subject.label_path(&scale.annot_file(&self.atlas, hemi)))
            .arg(subject.id())
            .arg(hemi.as_str())
    }

    fn aparc_to_aseg(
        &self,
        scale: ScaleDefinition,
        subject: &Subject,
        env: &ToolkitEnvironment,
    ) -> ToolInvocation {
        env.invocation("mri_aparc2aseg")
            .arg("--old-ribbon")
            .arg("--s")
            .arg(subject.id())
            .arg("--annot")
            .arg(scale.annotation(&self.atlas))
            .arg("--threads")
            .arg(self.threads.to_string())
            .arg("--o")
            .path_arg(subject.mri_path(&scale.volume_file(&self.atlas)))
    }

    fn convert(
        &self,
        scale: ScaleDefinition,
        subject: &Subject,
        env: &ToolkitEnvironment,
    ) -> ToolInvocation {
        env.invocation("mri_convert")
            .path_arg(subject.mri_path(&scale.volume_file(&self.atlas)))
            .path_arg(subject.mri_path(&scale.nifti_file(&self.atlas)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::scale::ALL_SCALES;
    use std::collections::BTreeMap;

    fn test_env() -> ToolkitEnvironment {
        let mut vars = BTreeMap::new();
        vars.insert("FREESURFER_HOME".to_string(), "/opt/fs".to_string());
        vars.insert("SUBJECTS_DIR".to_string(), "/subjects".to_string());
        ToolkitEnvironment::from_vars(vars).unwrap()
    }

    fn test_subject(env: &ToolkitEnvironment) -> Subject {
        Subject::in_environment("sub-01", "/raw/sub-01_T1w.nii.gz", env).unwrap()
    }

    #[test]
    fn test_every_scale_has_six_steps_in_order() {
        let env = test_env();
        let subject = test_subject(&env);
        let template = StageTemplate::new();

        for scale in ALL_SCALES {
            let stage = template.expand(scale, &subject, &env);
            assert_eq!(stage.label, StageLabel::Scale(scale));
            assert_eq!(stage.kinds(), StepKind::SCALE_ORDER.to_vec());
        }
    }

    #[test]
    fn test_expansion_is_deterministic() {
        let env = test_env();
        let subject = test_subject(&env);
        let template = StageTemplate::new();
        let scale = ScaleDefinition::new(4).unwrap();

        assert_eq!(
            template.expand(scale, &subject, &env),
            template.expand(scale, &subject, &env)
        );
    }

    #[test]
    fn test_surface_mapping_arguments() {
        let env = test_env();
        let subject = test_subject(&env);
        let stage = StageTemplate::new().expand(ScaleDefinition::new(1).unwrap(), &subject, &env);

        let lh = &stage.steps[0].invocation;
        assert_eq!(lh.program, "mri_surf2surf");
        assert_eq!(
            lh.args,
            vec![
                "--srcsubject",
                "fsaverage",
                "--trgsubject",
                "sub-01",
                "--hemi",
                "lh",
                "--sval-annot",
                "/subjects/fsaverage/label/lh.lausanne2018.scale1.annot",
                "--tval",
                "/subjects/sub-01/label/lh.lausanne2018.scale1.annot",
            ]
        );
        assert_eq!(lh.env["SUBJECTS_DIR"], "/subjects");
    }

    #[test]
    fn test_stats_arguments() {
        let env = test_env();
        let subject = test_subject(&env);
        let stage = StageTemplate::new().expand(ScaleDefinition::new(3).unwrap(), &subject, &env);

        let rh = &stage.steps[3].invocation;
        assert_eq!(rh.program, "mris_anatomical_stats");
        assert_eq!(
            rh.args,
            vec![
                "-th3",
                "-mgz",
                "-noglobal",
                "-cortex",
                "/subjects/sub-01/label/rh.cortex.label",
                "-f",
                "/subjects/sub-01/stats/rh.lausanne2018.scale3.stats",
                "-b",
                "-a",
                "/subjects/sub-01/label/rh.lausanne2018.scale3.annot",
                "sub-01",
                "rh",
            ]
        );
    }

    #[test]
    fn test_volume_steps_arguments() {
        let env = test_env();
        let subject = test_subject(&env);
        let stage = StageTemplate::new()
            .with_threads(4)
            .expand(ScaleDefinition::new(5).unwrap(), &subject, &env);

        let aseg = &stage.steps[4].invocation;
        assert_eq!(aseg.program, "mri_aparc2aseg");
        assert_eq!(
            aseg.args,
            vec![
                "--old-ribbon",
                "--s",
                "sub-01",
                "--annot",
                "lausanne2018.scale5",
                "--threads",
                "4",
                "--o",
                "/subjects/sub-01/mri/lausanne2018.scale5.mgz",
            ]
        );

        let convert = &stage.steps[5].invocation;
        assert_eq!(convert.program, "mri_convert");
        assert_eq!(
            convert.args,
            vec![
                "/subjects/sub-01/mri/lausanne2018.scale5.mgz",
                "/subjects/sub-01/mri/lausanne2018.scale5.nii.gz",
            ]
        );
    }

    #[test]
    fn test_reconstruction_stage() {
        let env = test_env();
        let subject = test_subject(&env);
        let stage = StageTemplate::new().reconstruction(&subject, &env);

        assert_eq!(stage.label, StageLabel::Reconstruction);
        assert_eq!(stage.len(), 1);
        assert_eq!(
            stage.steps[0].invocation.display_command(),
            "recon-all -s sub-01 -i /raw/sub-01_T1w.nii.gz -threads 8 -all"
        );
    }

    #[test]
    fn test_labels_display() {
        assert_eq!(StageLabel::Reconstruction.to_string(), "reconstruction");
        assert_eq!(
            StageLabel::Scale(ScaleDefinition::new(2).unwrap()).to_string(),
            "scale 2"
        );
        assert_eq!(StepKind::Aparc2Aseg.to_string(), "aparc2aseg");
    }
}
