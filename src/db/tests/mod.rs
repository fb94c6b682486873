mod cleanup;
mod jobs;
