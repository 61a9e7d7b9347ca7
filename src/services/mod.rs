pub mod report_scheduler;
