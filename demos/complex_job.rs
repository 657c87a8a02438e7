//! A multi-branch job: three images (one of them uploaded) merged into a
//! PDF, plus a thumbnail, packaged together as a zip.
//!
//! This example shows:
//! - Submitting a job graph written as JSON
//! - Following every task and the job through subscriptions
//! - Completing an upload against its form descriptor
//! - Printing the final per-task report

use anyhow::Result;
use jobgraph::{init_logging, EngineConfig, JobEvent, JobService, JobSpec, UploadedFile};

const JOB: &str = r##"{
  "tag": "complex-job",
  "tasks": {
    "fcWebpage": { "operation": "import/webpage", "url": "https://www.freeconvert.com" },
    "webpageScreenshot": {
      "operation": "convert",
      "input": "fcWebpage",
      "output_format": "png",
      "options": { "viewport_width": 300, "png_convert_quality": 80 }
    },
    "diceImage": {
      "operation": "import/url",
      "url": "https://upload.wikimedia.org/wikipedia/commons/4/47/PNG_transparency_demonstration_1.png"
    },
    "treeImage": { "operation": "import/upload" },
    "mergedPdf": {
      "operation": "merge",
      "input": ["webpageScreenshot", "diceImage", "treeImage"],
      "output_format": "pdf",
      "options": { "pdf_orientation": "portrait", "enlarge_images_to_fit": true }
    },
    "thumbnail": {
      "operation": "convert",
      "input": "diceImage",
      "output_format": "jpg",
      "options": { "quality": 80, "background": "#FF9900" }
    },
    "thumbnailExport": { "operation": "export/url", "input": "thumbnail", "filename": "Thumbnail.jpg" },
    "finalExport": {
      "operation": "export/url",
      "input": ["thumbnailExport", "mergedPdf"],
      "archive_multiple_files": true,
      "filename": "FinalPackage.zip"
    }
  }
}"##;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_logging(None)?;

    let config = EngineConfig::builder().max_concurrency(4).build()?;
    let service = JobService::new(config)?;

    let job = service.submit_job(JobSpec::from_json_str(JOB)?).await?;
    println!("Created job {}", job.id);

    let mut listeners = Vec::new();
    for task in &job.tasks {
        let mut sub = service.subscribe(&format!("task.{}", task.id))?;
        listeners.push(tokio::spawn(async move {
            while let Some(envelope) = sub.recv().await {
                match &envelope.event {
                    JobEvent::TaskStarted { task } => println!("Task started {}", task.name),
                    JobEvent::TaskCompleted { task } => println!("Task completed {}", task.name),
                    JobEvent::TaskFailed { task } => println!("Task failed {}", task.name),
                    _ => {}
                }
                if envelope.event.is_terminal() {
                    sub.unsubscribe();
                }
            }
        }));
    }

    // Second phase of the upload: post the file with the form parameters
    if let Some(upload) = job.task("treeImage") {
        if let Some(form) = upload.output().and_then(|o| o.form.clone()) {
            println!("Uploading tree.jpg to {}", form.url);
            let file = UploadedFile::new("tree.jpg", vec![0xFF, 0xD8, 0xFF, 0xE0]).with_form(&form);
            service.complete_upload(&upload.id, file)?;
        }
    }

    let finished = service.wait_for_job(&job.id).await?;
    for listener in listeners {
        listener.await?;
    }
    println!("Job {} {}", finished.id, finished.status);

    println!("{}", service.report(&job.id)?);
    if let Some(url) = finished
        .task("finalExport")
        .and_then(|t| t.output())
        .and_then(|o| o.url.as_deref())
    {
        println!("{url}");
    }
    Ok(())
}
